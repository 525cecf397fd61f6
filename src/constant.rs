use core::time::Duration;

/// Canopen function code prefixes on the COB-ID
pub const COB_FUNC_NMT: u16 = 0x000;
pub const COB_FUNC_SYNC: u16 = 0x080;
pub const COB_FUNC_TIMESTAMP: u16 = 0x100;
/// SDO server response messages (TSDO)
pub const COB_FUNC_TRANSMIT_SDO: u16 = 0x580;
/// SDO client request messages (RSDO)
pub const COB_FUNC_RECEIVE_SDO: u16 = 0x600;
pub const COB_FUNC_HEARTBEAT: u16 = 0x700;

/// Highest valid node id
pub const MAX_NODE_ID: u8 = 0x7F;

/// 11 valid COB-ID bits of an uint16
pub const MASK_COB_ID: u16 = 0x7FF;
/// 7-bit node id inside the COB-ID
pub const MASK_NODE_ID: u16 = 0x7F;
/// 4-bit function code inside the COB-ID
pub const MASK_FUNC_CODE: u16 = 0x780;

/// Valid 11-bit identifier bits in a standard frame id
pub const MASK_ID_SFF: u32 = 0x0000_07FF;
/// Valid 29-bit identifier bits in an extended frame id
pub const MASK_ID_EFF: u32 = 0x1FFF_FFFF;
/// Error flag in the frame id (0 = data frame, 1 = error message)
pub const MASK_ERR: u32 = 0x2000_0000;
/// Remote transmission request flag in the frame id
pub const MASK_RTR: u32 = 0x4000_0000;
/// Frame format flag (0 = standard, 1 = extended)
pub const MASK_EFF: u32 = 0x8000_0000;

/// How long a request/response exchange waits before giving up.
pub const SDO_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum gap between publishes for stand-alone requests.
pub const SDO_PUBLISH_GAP: Duration = Duration::from_millis(10);
/// Minimum gap between publishes during a segmented transfer.
pub const SDO_SEGMENT_PUBLISH_GAP: Duration = Duration::from_millis(2);
/// Minimum gap between publishes during a block transfer.
pub const SDO_BLOCK_PUBLISH_GAP: Duration = Duration::from_micros(500);

/// Back-off between block-mode retries.
pub const SDO_BLOCK_RETRY_DELAY: Duration = Duration::from_millis(1);
/// Publish attempts for one pipelined block segment.
pub const SDO_BLOCK_PUBLISH_ATTEMPTS: usize = 10;
/// Exchange attempts for the awaited segment at a window boundary.
pub const SDO_BLOCK_EXCHANGE_ATTEMPTS: usize = 5;

/// Pending initiate requests a server buffers before back-pressuring the bus.
pub const SDO_SERVER_QUEUE_CAPACITY: usize = 500;

/// Returns the request (client to server) COB-ID for a node.
pub fn sdo_request_cob_id(node_id: u8) -> u16 {
    COB_FUNC_RECEIVE_SDO + node_id as u16
}

/// Returns the response (server to client) COB-ID for a node.
pub fn sdo_response_cob_id(node_id: u8) -> u16 {
    COB_FUNC_TRANSMIT_SDO + node_id as u16
}
