//! A CANopen SDO (Service Data Object) protocol engine.
//!
//! SDO is the point-to-point, acknowledged transport of CiA 301 that lets
//! one node read or write an entry of another node's object dictionary,
//! addressed by a 16-bit index and an 8-bit sub-index. This crate
//! implements both peer roles over a pluggable [`bus::Bus`]:
//!
//! - [`sdo_client::SdoClient`] drives expedited, segmented and block
//!   downloads as well as expedited and segmented uploads.
//! - [`sdo_server::SdoServer`] answers requests by calling into a
//!   host-provided [`sdo_server::ObjectHandler`].
//!
//! [`bus::SocketCanBus`] attaches the engine to a Linux SocketCAN
//! interface; [`bus::LoopbackBus`] wires peers together in-process.

pub mod bus;
pub mod client;
pub mod cmd_header;
pub mod constant;
pub mod error;
pub mod frame;
pub mod lock;
pub mod sdo_client;
pub mod sdo_server;
pub mod util;
