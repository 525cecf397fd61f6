#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use canopen_sdo::bus::{Bus, CobIdSubscription, LoopbackBus, SubscriptionId};
use canopen_sdo::error::AbortCode;
use canopen_sdo::frame::{CanFrame, Frame, ObjectIndex};
use canopen_sdo::sdo_server::ObjectHandler;
use canopen_sdo::util::pad;

/// Writes to this index are rejected with "read only".
pub const READ_ONLY_INDEX: u16 = 0x1000;

/// Builds an 8-byte SDO frame.
pub fn genf(cob_id: u16, data: &[u8]) -> Frame {
    Frame::new(cob_id, &pad(data.to_vec(), 8))
}

/// An object dictionary that stores values in memory.
#[derive(Default)]
pub struct MemStore {
    entries: Mutex<HashMap<(u16, u8), Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object_index: ObjectIndex, data: Vec<u8>) {
        self.entries
            .lock()
            .unwrap()
            .insert((object_index.index, object_index.sub_index), data);
    }

    pub fn get(&self, object_index: ObjectIndex) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap()
            .get(&(object_index.index, object_index.sub_index))
            .cloned()
    }
}

impl ObjectHandler for MemStore {
    fn upload(&self, object_index: ObjectIndex) -> Result<Vec<u8>, AbortCode> {
        self.get(object_index)
            .ok_or(AbortCode::ObjectDoesNotExistInObjectDictionary)
    }

    fn download(&self, object_index: ObjectIndex, data: &[u8]) -> Result<(), AbortCode> {
        if object_index.index == READ_ONLY_INDEX {
            return Err(AbortCode::AttemptToWriteReadOnlyObject);
        }
        self.insert(object_index, data.to_vec());
        Ok(())
    }
}

/// Publishes `request` and asserts the next frame on the expected COB-ID
/// matches `expected` byte for byte.
pub fn send_and_expect(bus: &LoopbackBus, request: &Frame, expected: &Frame) {
    let subscription = CobIdSubscription::new(bus, expected.cob_id);
    bus.publish(request.to_can()).unwrap();
    let response = subscription
        .wait(Duration::from_secs(1))
        .unwrap_or_else(|_| panic!("no response to {:02x?}", request.data));
    assert_eq!(
        response.data,
        expected.to_can().data,
        "unexpected response on {:#x}",
        expected.cob_id
    );
}

/// Records every frame published on one COB-ID.
pub struct Sniffer {
    bus: Arc<LoopbackBus>,
    id: SubscriptionId,
    receiver: mpsc::Receiver<Frame>,
}

impl Sniffer {
    pub fn new(bus: &Arc<LoopbackBus>, cob_id: u16) -> Sniffer {
        let (sender, receiver) = mpsc::channel();
        let id = bus.subscribe(Arc::new(move |can: &CanFrame| {
            let frame = Frame::from_can(*can);
            if frame.cob_id == cob_id {
                let _ = sender.send(frame);
            }
        }));
        Sniffer {
            bus: bus.clone(),
            id,
            receiver,
        }
    }

    /// The next recorded frame; panics after one second.
    pub fn next(&self) -> Frame {
        self.receiver
            .recv_timeout(Duration::from_secs(1))
            .expect("expected a frame")
    }

    pub fn try_next(&self) -> Option<Frame> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
