use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct Slot {
    locked: bool,
    waiters: u32,
}

/// A keyed mutex over COB-IDs.
///
/// At most one transfer may be in flight between a client/server pair, so
/// every client operation holds the lock for its request COB-ID from the
/// initiate frame until the end of the transfer. Slots are created on
/// first use and evicted once the last holder releases with nobody
/// waiting, keeping the map bounded by the number of active peers.
#[derive(Default)]
pub struct CobIdLocks {
    slots: Mutex<HashMap<u16, Slot>>,
    released: Condvar,
}

impl CobIdLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the slot for `cob_id` is free and claims it.
    pub fn lock(&self, cob_id: u16) -> CobIdGuard<'_> {
        let mut slots = self.slots.lock().unwrap();
        loop {
            let slot = slots.entry(cob_id).or_default();
            if !slot.locked {
                slot.locked = true;
                return CobIdGuard {
                    locks: self,
                    cob_id,
                };
            }
            slot.waiters += 1;
            slots = self.released.wait(slots).unwrap();
            slots
                .get_mut(&cob_id)
                .expect("slot with waiters must exist")
                .waiters -= 1;
        }
    }

    fn release(&self, cob_id: u16) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(&cob_id) {
            slot.locked = false;
            if slot.waiters == 0 {
                slots.remove(&cob_id);
            }
        }
        drop(slots);
        self.released.notify_all();
    }

    /// Number of live slots; an idle map is empty.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the held COB-ID slot on drop.
pub struct CobIdGuard<'a> {
    locks: &'a CobIdLocks,
    cob_id: u16,
}

impl Drop for CobIdGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(self.cob_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_is_released_on_drop() {
        let locks = CobIdLocks::new();
        {
            let _guard = locks.lock(0x601);
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
        // Free again for the next transfer.
        let _guard = locks.lock(0x601);
    }

    #[test]
    fn test_different_keys_do_not_contend() {
        let locks = CobIdLocks::new();
        let _first = locks.lock(0x601);
        let _second = locks.lock(0x602);
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_same_key_excludes() {
        let locks = Arc::new(CobIdLocks::new());
        let concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    let _guard = locks.lock(0x601);
                    let active = concurrent.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(active, 0);
                    thread::sleep(Duration::from_micros(50));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(locks.is_empty());
    }
}
