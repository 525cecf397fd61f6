use core::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::bus::Bus;
use crate::client::{Client, Request};
use crate::cmd_header::{
    command_specifier, fits_expedited, ClientCommand, SdoBlockAckCmd, SdoInitiateCmd, ServerCommand,
};
use crate::constant::{
    SDO_BLOCK_EXCHANGE_ATTEMPTS, SDO_BLOCK_PUBLISH_ATTEMPTS, SDO_BLOCK_PUBLISH_GAP,
    SDO_BLOCK_RETRY_DELAY, SDO_RESPONSE_TIMEOUT, SDO_SEGMENT_PUBLISH_GAP,
};
use crate::error::ErrorCode;
use crate::frame::{Frame, ObjectIndex};
use crate::lock::CobIdLocks;
use crate::util::{has_bit, pad, retry, set_bit};

/// The SDO client side: writes (downloads) and reads (uploads) object
/// dictionary entries of a remote node.
///
/// One client should exist per bus; it owns the per-peer locks that keep
/// concurrent transfers to the same node from interleaving. All methods
/// take the request/response COB-ID pair explicitly; for the default SDO
/// channels see [`crate::constant::sdo_request_cob_id`] and
/// [`crate::constant::sdo_response_cob_id`].
pub struct SdoClient<'a, B: ?Sized> {
    bus: &'a B,
    locks: CobIdLocks,
    timeout: Duration,
}

impl<'a, B: Bus + ?Sized> SdoClient<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Self::with_timeout(bus, SDO_RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(bus: &'a B, timeout: Duration) -> Self {
        SdoClient {
            bus,
            locks: CobIdLocks::new(),
            timeout,
        }
    }

    /// Writes `data` to the object dictionary entry of a remote node.
    ///
    /// Payloads of one to four bytes travel inline with the initiate frame
    /// (expedited); everything else is sent in 7-byte segments with
    /// alternating toggle bits.
    pub fn download(
        &self,
        object_index: ObjectIndex,
        data: &[u8],
        request_cob_id: u16,
        response_cob_id: u16,
    ) -> Result<(), ErrorCode> {
        let _guard = self.locks.lock(request_cob_id);
        debug!(
            "sdo download: {} bytes to {:?} via {:#x}",
            data.len(),
            object_index,
            request_cob_id
        );

        let transfer = Transfer {
            client: Client::with_timeout(self.bus, self.timeout),
            object_index,
            request_cob_id,
            response_cob_id,
        };

        transfer.initiate_download(data, false)?;
        if fits_expedited(data.len()) {
            return Ok(());
        }
        transfer.run_segments(data)
    }

    /// Writes `data` using the windowed block protocol: bursts of up to
    /// `blksize` segments acknowledged once per window.
    pub fn block_download(
        &self,
        object_index: ObjectIndex,
        data: &[u8],
        request_cob_id: u16,
        response_cob_id: u16,
    ) -> Result<(), ErrorCode> {
        let _guard = self.locks.lock(request_cob_id);
        debug!(
            "sdo block download: {} bytes to {:?} via {:#x}",
            data.len(),
            object_index,
            request_cob_id
        );

        let transfer = Transfer {
            client: Client::with_timeout(self.bus, self.timeout),
            object_index,
            request_cob_id,
            response_cob_id,
        };

        let segments_per_block = transfer.initiate_download(data, true)?;
        transfer.run_block(data, segments_per_block)?;
        transfer.end_block(data.len())
    }

    /// Reads the current value of an object dictionary entry of a remote
    /// node.
    pub fn upload(
        &self,
        object_index: ObjectIndex,
        request_cob_id: u16,
        response_cob_id: u16,
    ) -> Result<Vec<u8>, ErrorCode> {
        let _guard = self.locks.lock(request_cob_id);
        debug!("sdo upload: {:?} via {:#x}", object_index, request_cob_id);

        let transfer = Transfer {
            client: Client::with_timeout(self.bus, self.timeout),
            object_index,
            request_cob_id,
            response_cob_id,
        };
        transfer.run_upload()
    }
}

/// State shared by the frames of one logical transfer.
struct Transfer<'a, B: ?Sized> {
    client: Client<'a, B>,
    object_index: ObjectIndex,
    request_cob_id: u16,
    response_cob_id: u16,
}

impl<B: Bus + ?Sized> Transfer<'_, B> {
    /// Sends the initiate frame and validates the response. For block
    /// transfers the returned value is the server-granted window size.
    fn initiate_download(&self, data: &[u8], block: bool) -> Result<usize, ErrorCode> {
        let request = Request::new(self.download_init_frame(data, block), self.response_cob_id);
        let response = self.client.request(&request)?;
        let resp = checked(response.frame)?;

        let expected = if block {
            ServerCommand::BlockDownload
        } else {
            ServerCommand::InitiateDownload
        } as u8;

        let scs = command_specifier(resp.data[0]);
        if scs == expected {
            // The response must echo the object index of the request.
            if self.object_index != resp.object_index()? {
                return Err(ErrorCode::TransferAborted {
                    abort_code: abort_code_bytes(&resp),
                });
            }
        } else if scs == ServerCommand::Abort as u8 {
            return Err(ErrorCode::TransferAborted {
                abort_code: abort_code_bytes(&resp),
            });
        } else {
            return Err(ErrorCode::UnexpectedScsResponse {
                expected,
                actual: scs,
                abort_code: abort_code_bytes(&resp),
            });
        }

        if !block {
            return Ok(0);
        }

        // The granted window size must fit the 7-bit sequence numbers.
        let blksize = resp.data[4];
        if blksize == 0 || blksize > 0x7F {
            return Err(ErrorCode::InvalidBlockSize { blksize });
        }
        Ok(blksize as usize)
    }

    /// The initiate frame: inline data when expedited, otherwise the
    /// little-endian total length in bytes 4..8.
    fn download_init_frame(&self, data: &[u8], block: bool) -> Frame {
        let ccs = if block {
            ClientCommand::BlockDownload
        } else {
            ClientCommand::InitiateDownload
        };
        let mut payload = vec![(ccs as u8) << 5];
        payload.extend_from_slice(&self.object_index.bytes());

        if !block && fits_expedited(data.len()) {
            // e = 1, s = 1, n = unused bytes of the 4-byte data field
            payload[0] = set_bit(payload[0], 1);
            payload[0] = set_bit(payload[0], 0);
            payload[0] += ((4 - data.len()) as u8) << 2;
            payload.extend_from_slice(data);
        } else {
            if block {
                // block transfers always indicate the size (s is bit 1)
                payload[0] = set_bit(payload[0], 1);
            } else {
                payload[0] = set_bit(payload[0], 0);
            }
            let mut size = [0u8; 4];
            LittleEndian::write_u32(&mut size, data.len() as u32);
            payload.extend_from_slice(&size);
        }

        Frame::new(self.request_cob_id, &pad(payload, 8))
    }

    /// Sends the payload as acknowledged 7-byte segments.
    fn run_segments(&self, data: &[u8]) -> Result<(), ErrorCode> {
        for frame in segment_frames(data, self.request_cob_id, false) {
            let request = Request::new(frame, self.response_cob_id);
            let response = self
                .client
                .request_min_duration(&request, SDO_SEGMENT_PUBLISH_GAP)?;
            let resp = checked(response.frame)?;

            let scs = command_specifier(resp.data[0]);
            if scs != ServerCommand::DownloadSegment as u8 {
                if scs == ServerCommand::Abort as u8 {
                    return Err(ErrorCode::TransferAborted {
                        abort_code: abort_code_bytes(&resp),
                    });
                }
                return Err(ErrorCode::UnexpectedScsResponse {
                    expected: ServerCommand::DownloadSegment as u8,
                    actual: scs,
                    abort_code: abort_code_bytes(&resp),
                });
            }

            let sent_toggle = has_bit(request.frame.data[0], 4);
            let echoed_toggle = has_bit(resp.data[0], 4);
            if sent_toggle != echoed_toggle {
                return Err(ErrorCode::UnexpectedToggleBit {
                    expected: sent_toggle,
                    actual: echoed_toggle,
                    abort_code: abort_code_bytes(&resp),
                });
            }
        }
        Ok(())
    }

    /// Streams the payload in windows of `segments_per_block` segments,
    /// waiting for one acknowledgment per window and resuming after the
    /// last acknowledged sequence number on a short ack.
    fn run_block(&self, data: &[u8], mut segments_per_block: usize) -> Result<(), ErrorCode> {
        let mut frames = segment_frames(data, self.request_cob_id, true);
        let mut segment_index = 0usize;
        let mut index = 0usize;

        while segment_index < frames.len() {
            // Pipeline all but the last segment of the window.
            while index + 1 < segments_per_block && segment_index + index + 1 < frames.len() {
                frames[segment_index + index].data[0] = segment_first_byte(index, false, 7, true);
                let can = frames[segment_index + index].to_can();
                retry(SDO_BLOCK_PUBLISH_ATTEMPTS, SDO_BLOCK_RETRY_DELAY, || {
                    self.client
                        .bus
                        .publish_min_duration(can, SDO_BLOCK_PUBLISH_GAP)
                })?;
                index += 1;
            }

            // The window closes with an acknowledged segment.
            let is_last = segment_index + index + 1 == frames.len();
            frames[segment_index + index].data[0] = segment_first_byte(index, is_last, 7, true);
            let request = Request::new(
                frames[segment_index + index].clone(),
                self.response_cob_id,
            );
            let response = retry(SDO_BLOCK_EXCHANGE_ATTEMPTS, SDO_BLOCK_RETRY_DELAY, || {
                self.client
                    .request_min_duration(&request, SDO_BLOCK_PUBLISH_GAP)
                    .map(|response| response.frame)
            })?;
            let resp = checked(response)?;

            let ack = SdoBlockAckCmd::from(resp.data[0]);
            if ack.scs() != ServerCommand::BlockDownload as u8 || ack.ss() != 2 {
                return Err(ErrorCode::UnexpectedScsResponse {
                    expected: ServerCommand::BlockDownload as u8,
                    actual: ack.scs(),
                    abort_code: abort_code_bytes(&resp),
                });
            }

            let ack_segment = resp.data[1] as usize;
            segments_per_block = resp.data[2] as usize;

            if is_last || ack_segment == segments_per_block {
                segment_index += ack_segment;
                index = 0;
            } else {
                // Retransmit from the segment after the last acknowledged one.
                index = ack_segment;
            }
        }
        Ok(())
    }

    /// The end-of-block handshake.
    fn end_block(&self, data_len: usize) -> Result<(), ErrorCode> {
        let mut header = (ClientCommand::BlockDownload as u8) << 5;
        // unused bytes of the last segment
        header |= ((7 - data_len % 7) as u8) << 2;
        // cs = 1 marks the end request
        header = set_bit(header, 0);

        let frame = Frame::new(self.request_cob_id, &pad(vec![header], 8));
        let request = Request::new(frame, self.response_cob_id);
        let response = self.client.request_min_duration(&request, Duration::ZERO)?;
        let resp = checked(response.frame)?;

        let scs = command_specifier(resp.data[0]);
        if scs != ServerCommand::BlockDownload as u8 || !has_bit(resp.data[0], 0) {
            return Err(ErrorCode::UnexpectedScsResponse {
                expected: ServerCommand::BlockDownload as u8,
                actual: scs,
                abort_code: abort_code_bytes(&resp),
            });
        }
        Ok(())
    }

    /// The whole upload state machine: initiate, then either the inline
    /// expedited data or the segment loop.
    fn run_upload(&self) -> Result<Vec<u8>, ErrorCode> {
        let mut payload = vec![(ClientCommand::InitiateUpload as u8) << 5];
        payload.extend_from_slice(&self.object_index.bytes());
        let request = Request::new(
            Frame::new(self.request_cob_id, &pad(payload, 8)),
            self.response_cob_id,
        );
        let response = self.client.request(&request)?;
        let resp = checked(response.frame)?;

        let scs = command_specifier(resp.data[0]);
        if scs != ServerCommand::InitiateUpload as u8 {
            if scs == ServerCommand::Abort as u8 {
                return Err(ErrorCode::TransferAborted {
                    abort_code: abort_code_bytes(&resp),
                });
            }
            return Err(ErrorCode::UnexpectedScsResponse {
                expected: ServerCommand::InitiateUpload as u8,
                actual: scs,
                abort_code: abort_code_bytes(&resp),
            });
        }
        if self.object_index != resp.object_index()? {
            return Err(ErrorCode::TransferAborted {
                abort_code: abort_code_bytes(&resp),
            });
        }

        let header = SdoInitiateCmd::from(resp.data[0]);
        if header.e() {
            // Without a size indication all four bytes are returned.
            let unused = if header.s() { header.n() as usize } else { 0 };
            return Ok(resp.data[4..8 - unused].to_vec());
        }

        let total = LittleEndian::read_u32(&resp.data[4..8]) as usize;
        let mut buf = Vec::new();
        let mut segment = 0usize;
        loop {
            let mut seg_header = (ClientCommand::UploadSegment as u8) << 5;
            if segment % 2 == 1 {
                seg_header = set_bit(seg_header, 4);
            }
            segment += 1;

            let request = Request::new(
                Frame::new(self.request_cob_id, &pad(vec![seg_header], 8)),
                self.response_cob_id,
            );
            let response = self
                .client
                .request_min_duration(&request, SDO_SEGMENT_PUBLISH_GAP)?;
            let resp = checked(response.frame)?;

            let scs = command_specifier(resp.data[0]);
            if scs != ServerCommand::UploadSegment as u8 {
                if scs == ServerCommand::Abort as u8 {
                    return Err(ErrorCode::TransferAborted {
                        abort_code: abort_code_bytes(&resp),
                    });
                }
                return Err(ErrorCode::UnexpectedScsResponse {
                    expected: ServerCommand::UploadSegment as u8,
                    actual: scs,
                    abort_code: abort_code_bytes(&resp),
                });
            }

            let sent_toggle = has_bit(seg_header, 4);
            let echoed_toggle = has_bit(resp.data[0], 4);
            if sent_toggle != echoed_toggle {
                return Err(ErrorCode::UnexpectedToggleBit {
                    expected: sent_toggle,
                    actual: echoed_toggle,
                    abort_code: abort_code_bytes(&resp),
                });
            }

            let unused = ((resp.data[0] >> 1) & 0x7) as usize;
            buf.extend_from_slice(&resp.data[1..8 - unused]);

            if buf.len() > total {
                return Err(ErrorCode::UnexpectedResponseLength {
                    expected: total,
                    actual: buf.len(),
                });
            }
            if has_bit(resp.data[0], 0) {
                if buf.len() != total {
                    return Err(ErrorCode::UnexpectedResponseLength {
                        expected: total,
                        actual: buf.len(),
                    });
                }
                break;
            }
        }
        Ok(buf)
    }
}

/// SDO responses occupy all eight data bytes.
fn checked(frame: Frame) -> Result<Frame, ErrorCode> {
    if frame.data.len() < 8 {
        return Err(ErrorCode::MalformedFrame {
            expected: 8,
            actual: frame.data.len(),
        });
    }
    Ok(frame)
}

/// The abort code carried in bytes 4..8, if the frame is long enough.
fn abort_code_bytes(frame: &Frame) -> Vec<u8> {
    if frame.data.len() >= 8 {
        frame.data[4..].to_vec()
    } else {
        Vec::new()
    }
}

/// Splits the payload into ready-to-send segment frames. The empty payload
/// becomes a single segment carrying no data.
fn segment_frames(data: &[u8], request_cob_id: u16, block: bool) -> Vec<Frame> {
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![&data[..]]
    } else {
        data.chunks(7).collect()
    };

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut payload = vec![segment_first_byte(i, i == chunks.len() - 1, chunk.len(), block)];
            payload.extend_from_slice(chunk);
            Frame::new(request_cob_id, &pad(payload, 8))
        })
        .collect()
}

/// The header byte of segment `i`: toggle and fill count for segmented
/// mode, the 1-based sequence number for block mode, plus the final-segment
/// marker.
fn segment_first_byte(i: usize, is_last: bool, chunk_len: usize, block: bool) -> u8 {
    let mut first = 0u8;
    if !block {
        if chunk_len < 7 {
            first |= ((7 - chunk_len) as u8) << 1;
        }
        if i % 2 == 1 {
            first = set_bit(first, 4);
        }
    } else {
        first = (i + 1) as u8;
    }

    if is_last {
        first = if block {
            set_bit(first, 7)
        } else {
            set_bit(first, 0)
        };
    }
    first
}
