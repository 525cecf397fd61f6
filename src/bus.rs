use core::time::Duration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::constant::{MASK_EFF, MASK_ID_SFF, MASK_RTR};
use crate::error::ErrorCode;
use crate::frame::CanFrame;

/// Callback invoked for every frame seen on the bus.
pub type FrameCallback = Arc<dyn Fn(&CanFrame) + Send + Sync>;

/// Handle returned by [`Bus::subscribe`], used to unregister again.
pub type SubscriptionId = usize;

/// The CAN link layer as the protocol engine sees it.
///
/// A bus serializes publishes and broadcasts every received frame to all
/// registered subscribers. Implementations must be shareable across
/// threads; the engine publishes from client callers and server workers
/// while the driver delivers frames on its own thread of control.
pub trait Bus: Send + Sync {
    /// Sends one frame.
    fn publish(&self, frame: CanFrame) -> Result<(), ErrorCode>;

    /// Sends one frame, waiting until at least `min` has passed since the
    /// previous publish on this bus.
    fn publish_min_duration(&self, frame: CanFrame, min: Duration) -> Result<(), ErrorCode>;

    /// Registers a callback for all received frames.
    fn subscribe(&self, callback: FrameCallback) -> SubscriptionId;

    /// Removes a previously registered callback.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Registration bookkeeping shared by the bus implementations.
#[derive(Default)]
struct SubscriberTable {
    subscribers: Mutex<HashMap<SubscriptionId, FrameCallback>>,
    next_id: AtomicUsize,
}

impl SubscriberTable {
    fn add(&self, callback: FrameCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, callback);
        id
    }

    fn remove(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    fn dispatch(&self, frame: &CanFrame) {
        // Callbacks run outside the table lock so they may re-enter the bus.
        let callbacks: Vec<FrameCallback> =
            self.subscribers.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            callback(frame);
        }
    }
}

/// A one-shot subscription for the next frame carrying a given COB-ID.
///
/// Registering before publishing the request closes the race between the
/// request going out and the response coming back. Dropping the
/// subscription unregisters it.
pub struct CobIdSubscription<'a, B: Bus + ?Sized> {
    bus: &'a B,
    id: SubscriptionId,
    cob_id: u16,
    receiver: mpsc::Receiver<CanFrame>,
}

impl<'a, B: Bus + ?Sized> CobIdSubscription<'a, B> {
    pub fn new(bus: &'a B, cob_id: u16) -> Self {
        let (sender, receiver) = mpsc::sync_channel(1);
        let id = bus.subscribe(Arc::new(move |frame: &CanFrame| {
            if frame.id & (MASK_EFF | MASK_RTR) == 0 && frame.id & MASK_ID_SFF == cob_id as u32 {
                let _ = sender.try_send(*frame);
            }
        }));
        CobIdSubscription {
            bus,
            id,
            cob_id,
            receiver,
        }
    }

    /// Blocks until the frame arrives or `timeout` expires.
    pub fn wait(&self, timeout: Duration) -> Result<CanFrame, ErrorCode> {
        self.receiver
            .recv_timeout(timeout)
            .map_err(|_| ErrorCode::Timeout {
                cob_id: self.cob_id,
            })
    }
}

impl<B: Bus + ?Sized> Drop for CobIdSubscription<'_, B> {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

/// An in-process bus: every published frame is delivered to all
/// subscribers on the publisher's thread.
///
/// Attaching a client and a server to the same `LoopbackBus` wires them
/// together without hardware, which is how the test-suite exercises the
/// whole protocol stack.
#[derive(Default)]
pub struct LoopbackBus {
    subscribers: SubscriberTable,
    last_publish: Mutex<Option<Instant>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bus for LoopbackBus {
    fn publish(&self, frame: CanFrame) -> Result<(), ErrorCode> {
        self.publish_min_duration(frame, Duration::ZERO)
    }

    fn publish_min_duration(&self, frame: CanFrame, min: Duration) -> Result<(), ErrorCode> {
        {
            let mut last = self.last_publish.lock().unwrap();
            if let Some(previous) = *last {
                let elapsed = previous.elapsed();
                if elapsed < min {
                    thread::sleep(min - elapsed);
                }
            }
            *last = Some(Instant::now());
        }
        self.subscribers.dispatch(&frame);
        Ok(())
    }

    fn subscribe(&self, callback: FrameCallback) -> SubscriptionId {
        self.subscribers.add(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.remove(id);
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::SocketCanBus;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    use std::os::fd::AsRawFd;
    use std::sync::atomic::AtomicBool;
    use std::thread::JoinHandle;

    use embedded_can::Frame as _;
    use log::{error, info};
    use nix::poll::{poll, PollFd, PollFlags};
    use socketcan::{CanSocket, EmbeddedFrame, Socket};

    use crate::constant::MASK_EFF;

    /// A [`Bus`] backed by a Linux SocketCAN interface.
    ///
    /// Two socket handles are opened on the interface: one for writing and
    /// one polled by a receive thread that broadcasts every incoming frame
    /// to the subscribers. The receive thread is joined when the bus is
    /// dropped.
    pub struct SocketCanBus {
        tx_socket: Mutex<CanSocket>,
        subscribers: Arc<SubscriberTable>,
        last_publish: Mutex<Option<Instant>>,
        running: Arc<AtomicBool>,
        rx_thread: Option<JoinHandle<()>>,
    }

    impl SocketCanBus {
        pub fn open(interface: &str) -> Result<Self, ErrorCode> {
            let tx_socket = CanSocket::open(interface).map_err(|err| ErrorCode::LinkError {
                reason: format!("failed to open {}: {}", interface, err),
            })?;
            let rx_socket = CanSocket::open(interface).map_err(|err| ErrorCode::LinkError {
                reason: format!("failed to open {}: {}", interface, err),
            })?;

            let subscribers = Arc::new(SubscriberTable::default());
            let running = Arc::new(AtomicBool::new(true));

            let thread_subscribers = subscribers.clone();
            let thread_running = running.clone();
            let rx_thread = thread::spawn(move || {
                receive_loop(rx_socket, thread_subscribers, thread_running);
            });
            info!("listening on CAN interface {}", interface);

            Ok(SocketCanBus {
                tx_socket: Mutex::new(tx_socket),
                subscribers,
                last_publish: Mutex::new(None),
                running,
                rx_thread: Some(rx_thread),
            })
        }
    }

    impl Bus for SocketCanBus {
        fn publish(&self, frame: CanFrame) -> Result<(), ErrorCode> {
            self.publish_min_duration(frame, Duration::ZERO)
        }

        fn publish_min_duration(&self, frame: CanFrame, min: Duration) -> Result<(), ErrorCode> {
            let socket_frame = to_socketcan(&frame)?;

            let mut last = self.last_publish.lock().unwrap();
            if let Some(previous) = *last {
                let elapsed = previous.elapsed();
                if elapsed < min {
                    thread::sleep(min - elapsed);
                }
            }
            let result = self
                .tx_socket
                .lock()
                .unwrap()
                .write_frame(&socket_frame)
                .map_err(|err| ErrorCode::LinkError {
                    reason: format!("write failed: {}", err),
                });
            *last = Some(Instant::now());
            result
        }

        fn subscribe(&self, callback: FrameCallback) -> SubscriptionId {
            self.subscribers.add(callback)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.subscribers.remove(id);
        }
    }

    impl Drop for SocketCanBus {
        fn drop(&mut self) {
            self.running.store(false, Ordering::Relaxed);
            if let Some(handle) = self.rx_thread.take() {
                let _ = handle.join();
            }
        }
    }

    fn receive_loop(socket: CanSocket, subscribers: Arc<SubscriberTable>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            let mut fds = [PollFd::new(socket.as_raw_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, 100) {
                Ok(0) => continue,
                Ok(_) => match socket.read_frame() {
                    Ok(frame) => subscribers.dispatch(&from_socketcan(&frame)),
                    Err(err) => error!("error reading CAN frame: {}", err),
                },
                Err(err) => {
                    error!("poll failed on CAN socket: {}", err);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn from_socketcan(frame: &socketcan::CanFrame) -> CanFrame {
        let mut id = match frame.id() {
            embedded_can::Id::Standard(sid) => sid.as_raw() as u32,
            embedded_can::Id::Extended(eid) => eid.as_raw() | MASK_EFF,
        };
        if frame.is_remote_frame() {
            id |= MASK_RTR;
        }
        let payload = frame.data();
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        CanFrame {
            id,
            length: frame.dlc() as u8,
            data,
        }
    }

    fn to_socketcan(frame: &CanFrame) -> Result<socketcan::CanFrame, ErrorCode> {
        let id = frame.id();
        let socket_frame = if frame.is_remote_frame() {
            socketcan::CanFrame::new_remote(id, frame.length as usize)
        } else {
            socketcan::CanFrame::new(id, frame.data())
        };
        socket_frame.ok_or(ErrorCode::FrameCreationFailed {
            data: frame.data.to_vec(),
        })
    }
}
