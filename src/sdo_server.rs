use core::time::Duration;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};

use crate::bus::{Bus, SubscriptionId};
use crate::client::{Client, Request};
use crate::cmd_header::{command_specifier, fits_expedited, server_response_byte, ClientCommand, SdoInitiateCmd, ServerCommand};
use crate::constant::{
    sdo_request_cob_id, sdo_response_cob_id, COB_FUNC_RECEIVE_SDO, SDO_RESPONSE_TIMEOUT,
    SDO_SERVER_QUEUE_CAPACITY,
};
use crate::error::{AbortCode, ErrorCode};
use crate::frame::{CanFrame, Frame, ObjectIndex};
use crate::util::{has_bit, pad};

/// The application side of an SDO server: the object dictionary as two
/// upcalls.
///
/// Both are invoked from the server's worker thread, one transfer at a
/// time. Returning an abort code turns into an Abort frame on the bus.
pub trait ObjectHandler: Send + Sync {
    /// Returns the current value of an entry.
    fn upload(&self, object_index: ObjectIndex) -> Result<Vec<u8>, AbortCode>;

    /// Accepts and persists a new value for an entry.
    fn download(&self, object_index: ObjectIndex, data: &[u8]) -> Result<(), AbortCode>;
}

/// Serves the object dictionary of one node id over SDO.
///
/// `start` registers a dispatcher on the bus that filters initiate
/// requests addressed to this node into a bounded queue; a single worker
/// thread services them in order, so at most one transfer is in progress
/// at any time. A full queue back-pressures the bus dispatcher instead of
/// dropping requests. Dropping the server unregisters the dispatcher and
/// joins the worker.
pub struct SdoServer<B: Bus + 'static> {
    inner: Arc<Inner<B>>,
    subscription: Option<SubscriptionId>,
    worker: Option<JoinHandle<()>>,
}

struct Inner<B> {
    bus: Arc<B>,
    node_id: u8,
    handler: Arc<dyn ObjectHandler>,
    request_cob_id: u16,
    response_cob_id: u16,
    timeout: Duration,
}

impl<B: Bus + 'static> SdoServer<B> {
    pub fn new(bus: Arc<B>, node_id: u8, handler: Arc<dyn ObjectHandler>) -> Self {
        Self::with_timeout(bus, node_id, handler, SDO_RESPONSE_TIMEOUT)
    }

    /// Like [`SdoServer::new`] with a custom wait limit for the client's
    /// mid-transfer responses.
    pub fn with_timeout(
        bus: Arc<B>,
        node_id: u8,
        handler: Arc<dyn ObjectHandler>,
        timeout: Duration,
    ) -> Self {
        SdoServer {
            inner: Arc::new(Inner {
                bus,
                node_id,
                handler,
                request_cob_id: sdo_request_cob_id(node_id),
                response_cob_id: sdo_response_cob_id(node_id),
                timeout,
            }),
            subscription: None,
            worker: None,
        }
    }

    /// Registers the dispatcher and spawns the worker. Idempotent.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }

        let (sender, receiver) = sync_channel::<Frame>(SDO_SERVER_QUEUE_CAPACITY);

        let node_id = self.inner.node_id;
        let subscription = self.inner.bus.subscribe(Arc::new(move |can: &CanFrame| {
            let frame = Frame::from_can(*can);
            if frame.node_id() != node_id
                || frame.message_type() != COB_FUNC_RECEIVE_SDO
                || frame.data.len() != 8
            {
                return;
            }
            match ClientCommand::try_from(command_specifier(frame.data[0])) {
                Ok(ClientCommand::InitiateDownload) | Ok(ClientCommand::InitiateUpload) => {
                    // A full queue blocks the link dispatcher; nothing is dropped.
                    let _ = sender.send(frame);
                }
                _ => {}
            }
        }));

        let inner = self.inner.clone();
        let worker = thread::spawn(move || worker_loop(inner, receiver));

        self.subscription = Some(subscription);
        self.worker = Some(worker);
        info!("sdo server for node {} started", node_id);
    }
}

impl<B: Bus + 'static> Drop for SdoServer<B> {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.take() {
            // Dropping the dispatcher closes the queue, which ends the worker.
            self.inner.bus.unsubscribe(id);
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// An initiate response echoes the object index of the request, so the
/// client can correlate it.
fn initiate_response(scs: ServerCommand, object_index: ObjectIndex) -> Vec<u8> {
    let mut payload = vec![server_response_byte(scs, false)];
    payload.extend_from_slice(&object_index.bytes());
    payload
}

fn worker_loop<B: Bus>(inner: Arc<Inner<B>>, receiver: Receiver<Frame>) {
    for frame in receiver {
        match ClientCommand::try_from(command_specifier(frame.data[0])) {
            Ok(ClientCommand::InitiateUpload) => inner.handle_upload(&frame),
            Ok(ClientCommand::InitiateDownload) => inner.handle_download(&frame),
            _ => {}
        }
    }
    debug!("sdo server worker for node {} stopped", inner.node_id);
}

impl<B: Bus> Inner<B> {
    fn publish(&self, payload: Vec<u8>) -> Result<(), ErrorCode> {
        let frame = Frame::new(self.response_cob_id, &pad(payload, 8));
        self.bus.publish(frame.to_can())
    }

    /// Publishes a response and waits for the client's next request frame.
    fn publish_and_wait(&self, payload: Vec<u8>) -> Result<Frame, ErrorCode> {
        let client = Client::with_timeout(&*self.bus, self.timeout);
        let request = Request::new(
            Frame::new(self.response_cob_id, &pad(payload, 8)),
            self.request_cob_id,
        );
        Ok(client.request(&request)?.frame)
    }

    fn publish_abort(&self, code: AbortCode, object_index: ObjectIndex) {
        warn!(
            "sdo abort for {:?} on node {}: {}",
            object_index,
            self.node_id,
            code.description()
        );
        let mut payload = vec![server_response_byte(ServerCommand::Abort, false)];
        payload.extend_from_slice(&object_index.bytes());
        let mut code_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut code_bytes, code.code());
        payload.extend_from_slice(&code_bytes);
        if let Err(err) = self.publish(payload) {
            error!("failed to publish abort frame: {:?}", err);
        }
    }

    fn handle_download(&self, frame: &Frame) {
        let object_index = match frame.object_index() {
            Ok(object_index) => object_index,
            Err(_) => return,
        };
        debug!("download request for {:?}", object_index);

        let cmd = SdoInitiateCmd::from(frame.data[0]);
        if cmd.e() {
            // Expedited: the payload came inline with the initiate frame.
            let data = &frame.data[4..8 - cmd.n() as usize];
            match self.handler.download(object_index, data) {
                Ok(()) => {
                    let _ = self.publish(initiate_response(
                        ServerCommand::InitiateDownload,
                        object_index,
                    ));
                }
                Err(code) => self.publish_abort(code, object_index),
            }
            return;
        }

        self.segmented_download(frame, object_index);
    }

    fn segmented_download(&self, frame: &Frame, object_index: ObjectIndex) {
        let total = LittleEndian::read_u32(&frame.data[4..8]) as usize;

        // Accept the transfer, which hands us the first segment.
        let mut resp = match self.publish_and_wait(initiate_response(
            ServerCommand::InitiateDownload,
            object_index,
        )) {
            Ok(resp) => resp,
            Err(_) => {
                self.publish_abort(AbortCode::SdoProtocolTimedOut, object_index);
                return;
            }
        };

        let mut buf: Vec<u8> = Vec::new();
        // The first segment must carry toggle 0.
        let mut last_toggle = true;
        let mut toggle;
        loop {
            if resp.data.len() < 8
                || command_specifier(resp.data[0]) != ClientCommand::DownloadSegment as u8
            {
                self.publish_abort(AbortCode::CommandSpecifierNotValidOrUnknown, object_index);
                return;
            }

            toggle = has_bit(resp.data[0], 4);
            if toggle == last_toggle {
                self.publish_abort(AbortCode::ToggleBitNotAlternated, object_index);
                return;
            }

            let unused = ((resp.data[0] >> 1) & 0x7) as usize;
            let no_more = has_bit(resp.data[0], 0);
            buf.extend_from_slice(&resp.data[1..8 - unused]);
            last_toggle = toggle;

            if no_more {
                break;
            }

            resp = match self.publish_and_wait(vec![server_response_byte(
                ServerCommand::DownloadSegment,
                toggle,
            )]) {
                Ok(resp) => resp,
                Err(_) => {
                    self.publish_abort(AbortCode::SdoProtocolTimedOut, object_index);
                    return;
                }
            };
        }

        if total != 0 && buf.len() > total {
            buf.truncate(total);
        }

        match self.handler.download(object_index, &buf) {
            Ok(()) => {
                let _ = self.publish(vec![server_response_byte(
                    ServerCommand::DownloadSegment,
                    toggle,
                )]);
            }
            Err(code) => self.publish_abort(code, object_index),
        }
    }

    fn handle_upload(&self, frame: &Frame) {
        let object_index = match frame.object_index() {
            Ok(object_index) => object_index,
            Err(_) => return,
        };
        debug!("upload request for {:?}", object_index);

        let data = match self.handler.upload(object_index) {
            Ok(data) => data,
            Err(code) => {
                self.publish_abort(code, object_index);
                return;
            }
        };

        if fits_expedited(data.len()) {
            self.expedited_upload(data, object_index);
        } else {
            self.segmented_upload(data, object_index);
        }
    }

    fn expedited_upload(&self, data: Vec<u8>, object_index: ObjectIndex) {
        // scs = 2, e = 1, s = 1, n = unused bytes of the 4-byte field
        let mut header = ((ServerCommand::InitiateUpload as u8) << 5) | 0x03;
        header += ((4 - data.len()) as u8) << 2;

        let mut payload = vec![header];
        payload.extend_from_slice(&object_index.bytes());
        payload.extend_from_slice(&pad(data, 4));
        let _ = self.publish(payload);
    }

    fn segmented_upload(&self, data: Vec<u8>, object_index: ObjectIndex) {
        // scs = 2, s = 1, total length in bytes 4..8
        let mut current = vec![((ServerCommand::InitiateUpload as u8) << 5) | 0x01];
        current.extend_from_slice(&object_index.bytes());
        let mut size = [0u8; 4];
        LittleEndian::write_u32(&mut size, data.len() as u32);
        current.extend_from_slice(&size);

        let segments: Vec<&[u8]> = if data.is_empty() {
            // a single segment carrying no data
            vec![&data[..]]
        } else {
            data.chunks(7).collect()
        };

        for (i, segment) in segments.iter().enumerate() {
            let resp = match self.publish_and_wait(current) {
                Ok(resp) => resp,
                Err(_) => {
                    self.publish_abort(AbortCode::SdoProtocolTimedOut, object_index);
                    return;
                }
            };

            if resp.data.len() < 8
                || command_specifier(resp.data[0]) != ClientCommand::UploadSegment as u8
            {
                self.publish_abort(AbortCode::CommandSpecifierNotValidOrUnknown, object_index);
                return;
            }

            // Echo the client's toggle bit.
            let toggle = has_bit(resp.data[0], 4);
            let mut header = server_response_byte(ServerCommand::UploadSegment, toggle);
            header += ((7 - segment.len()) as u8) << 1;
            if i == segments.len() - 1 {
                header += 1;
            }

            current = vec![header];
            current.extend_from_slice(&pad(segment.to_vec(), 7));
        }

        // The last prepared segment goes out without awaiting another request.
        let _ = self.publish(current);
    }
}
