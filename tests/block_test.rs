mod testing;

use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use canopen_sdo::bus::{Bus, LoopbackBus};
use canopen_sdo::frame::{CanFrame, Frame, ObjectIndex};
use canopen_sdo::sdo_client::SdoClient;
use testing::util::genf;

const REQ: u16 = 0x601;
const RESP: u16 = 0x581;

/// A scripted block-download peer: grants `blksize` segments per window,
/// acknowledges each window, and reassembles the payload.
///
/// With `short_ack` set, the first window is acknowledged at that sequence
/// number and the bytes beyond it are discarded, forcing the client to
/// retransmit from `short_ack + 1`.
fn spawn_block_responder(
    bus: &Arc<LoopbackBus>,
    blksize: u8,
    mut short_ack: Option<u8>,
) -> JoinHandle<Vec<u8>> {
    let bus = bus.clone();
    thread::spawn(move || {
        let (sender, receiver) = mpsc::channel();
        let id = bus.subscribe(Arc::new(move |can: &CanFrame| {
            let frame = Frame::from_can(*can);
            if frame.cob_id == REQ {
                let _ = sender.send(frame);
            }
        }));

        let reply = |payload: &[u8]| {
            bus.publish(genf(RESP, payload).to_can()).unwrap();
        };
        let recv = || {
            receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("client stopped talking")
        };

        // Initiate: note the announced size, grant the window size and
        // echo the object index.
        let init = recv();
        assert_eq!(init.data[0] >> 5, 6, "expected a block download initiate");
        assert_eq!(init.data[0] & 0x01, 0);
        let total = u32::from_le_bytes([init.data[4], init.data[5], init.data[6], init.data[7]])
            as usize;
        reply(&[
            0xA0,
            init.data[1],
            init.data[2],
            init.data[3],
            blksize,
            0,
            0,
            0,
        ]);

        let mut payload: Vec<u8> = Vec::new();
        let mut window: Vec<u8> = Vec::new();
        let mut expected: u8 = 1;
        let mut done = false;

        loop {
            let frame = recv();

            if done {
                // Only the end frame is left. Its fill count follows the
                // sender's `7 - total % 7` formula (7 for exact multiples);
                // the payload itself is cut to the announced size.
                assert_eq!(frame.data[0] >> 5, 6);
                assert_eq!(frame.data[0] & 0x01, 1);
                let fill = ((frame.data[0] >> 2) & 0x07) as usize;
                assert_eq!(fill, 7 - total % 7);
                payload.truncate(total);
                reply(&[0xA1]);
                bus.unsubscribe(id);
                return payload;
            }

            let sequence = frame.data[0] & 0x7F;
            let last = frame.data[0] & 0x80 != 0;
            if sequence == expected {
                window.extend_from_slice(&frame.data[1..8]);
                expected += 1;
            }

            if last || sequence == blksize {
                let acked = match short_ack.take() {
                    Some(short) => short.min(expected - 1),
                    None => expected - 1,
                };
                window.truncate(acked as usize * 7);
                payload.append(&mut window);

                if last && acked == expected - 1 {
                    done = true;
                }
                reply(&[0xA2, acked, blksize]);
                expected = if acked == blksize { 1 } else { acked + 1 };
            }
        }
    })
}

#[test]
fn test_block_download() {
    let bus = Arc::new(LoopbackBus::new());
    let data: Vec<u8> = (0..20).collect();
    let responder = spawn_block_responder(&bus, 4, None);

    let client = SdoClient::new(&*bus);
    client
        .block_download(ObjectIndex::new(0x2000, 0x00), &data, REQ, RESP)
        .unwrap();

    assert_eq!(responder.join().unwrap(), data);
}

#[test]
fn test_block_download_spanning_windows() {
    let bus = Arc::new(LoopbackBus::new());
    let data: Vec<u8> = (0..50).collect();
    let responder = spawn_block_responder(&bus, 7, None);

    let client = SdoClient::new(&*bus);
    client
        .block_download(ObjectIndex::new(0x2000, 0x01), &data, REQ, RESP)
        .unwrap();

    assert_eq!(responder.join().unwrap(), data);
}

#[test]
fn test_block_download_resumes_after_short_ack() {
    let bus = Arc::new(LoopbackBus::new());
    let data: Vec<u8> = (100..150).collect();
    let responder = spawn_block_responder(&bus, 7, Some(3));

    let client = SdoClient::new(&*bus);
    client
        .block_download(ObjectIndex::new(0x2000, 0x02), &data, REQ, RESP)
        .unwrap();

    assert_eq!(responder.join().unwrap(), data);
}

#[test]
fn test_block_download_of_exact_window_multiple() {
    let bus = Arc::new(LoopbackBus::new());
    // 28 bytes: four full segments, one window of four
    let data: Vec<u8> = (0..28).collect();
    let responder = spawn_block_responder(&bus, 4, None);

    let client = SdoClient::new(&*bus);
    client
        .block_download(ObjectIndex::new(0x2000, 0x03), &data, REQ, RESP)
        .unwrap();

    assert_eq!(responder.join().unwrap(), data);
}
