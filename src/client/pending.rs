//! Pending-request table for one client connection.
//!
//! A fixed-capacity arena of slots. A message id packs the slot index in
//! its low 32 bits and the slot's generation in the high 32 bits:
//!
//! ```text
//! msg_id = (generation << 32) | index
//! ```
//!
//! Resolving a call removes its entry under the slot's own lock, so a
//! response, the caller's deadline, the sweeper and connection close can
//! race freely: whoever takes the entry first resolves the call and every
//! other attempt is a no-op. A late response for a freed slot carries an
//! old generation and never matches the slot's next occupant.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{HighwayError, Result};
use crate::protocol::Frame;

/// Outcome delivered to a waiting caller.
pub(crate) type CallOutcome = Result<Frame>;

struct Entry {
    deadline: Instant,
    timeout_ms: u64,
    tx: oneshot::Sender<CallOutcome>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct FreeList {
    indexes: Vec<u32>,
    closed: bool,
}

/// Fixed-capacity correlation table.
pub(crate) struct PendingTable {
    slots: Box<[Mutex<Slot>]>,
    free: Mutex<FreeList>,
    len: AtomicUsize,
}

impl PendingTable {
    /// Create a table holding at most `capacity` in-flight calls.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        let slots = (0..capacity).map(|_| Mutex::new(Slot::default())).collect();
        // Reversed so the lowest index is handed out first.
        let indexes = (0..capacity as u32).rev().collect();

        Self {
            slots,
            free: Mutex::new(FreeList {
                indexes,
                closed: false,
            }),
            len: AtomicUsize::new(0),
        }
    }

    /// Register a call and return its message id and completion receiver.
    ///
    /// Fails with `TooManyPending` when every slot is in use and with
    /// `TransportFailure` once the table has been closed.
    pub(crate) fn register(
        &self,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<(u64, oneshot::Receiver<CallOutcome>)> {
        let (tx, rx) = oneshot::channel();

        // Lock order: free list, then slot. `close` takes the same order.
        let mut free = self.free.lock();
        if free.closed {
            return Err(HighwayError::TransportFailure("Connection closed".into()));
        }
        let index = free
            .indexes
            .pop()
            .ok_or(HighwayError::TooManyPending(self.slots.len()))?;

        let mut slot = self.slots[index as usize].lock();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.entry = Some(Entry {
            deadline,
            timeout_ms,
            tx,
        });
        let msg_id = compose(slot.generation, index);
        self.len.fetch_add(1, Ordering::AcqRel);
        drop(slot);
        drop(free);

        Ok((msg_id, rx))
    }

    /// Resolve a call with `outcome`.
    ///
    /// Returns `false` if the id is unknown or the call was already resolved.
    pub(crate) fn complete(&self, msg_id: u64, outcome: CallOutcome) -> bool {
        match self.claim(msg_id) {
            Some(entry) => {
                // The caller may have gone away; the slot is free either way.
                let _ = entry.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve a call with `RequestTimeout` if it is still pending.
    pub(crate) fn expire(&self, msg_id: u64) -> bool {
        match self.claim(msg_id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(HighwayError::RequestTimeout {
                    msg_id,
                    timeout_ms: entry.timeout_ms,
                }));
                true
            }
            None => false,
        }
    }

    /// Expire every call whose deadline is at or before `now`.
    ///
    /// Returns the number of calls expired.
    pub(crate) fn expire_due(&self, now: Instant) -> usize {
        if self.is_empty() {
            return 0;
        }

        let mut expired = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let taken = {
                let mut slot = slot.lock();
                let due = slot.entry.as_ref().is_some_and(|e| e.deadline <= now);
                let generation = slot.generation;
                if due {
                    slot.entry.take().map(|entry| (generation, entry))
                } else {
                    None
                }
            };

            if let Some((generation, entry)) = taken {
                self.release(index as u32);
                let msg_id = compose(generation, index as u32);
                let _ = entry.tx.send(Err(HighwayError::RequestTimeout {
                    msg_id,
                    timeout_ms: entry.timeout_ms,
                }));
                expired += 1;
            }
        }
        expired
    }

    /// Close the table and fail every pending call with `TransportFailure`.
    ///
    /// Later registrations fail. Returns the number of calls failed.
    pub(crate) fn close(&self, reason: &str) -> usize {
        let mut free = self.free.lock();
        if free.closed {
            return 0;
        }
        free.closed = true;

        let mut failed = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let entry = slot.lock().entry.take();
            if let Some(entry) = entry {
                free.indexes.push(index as u32);
                let _ = entry
                    .tx
                    .send(Err(HighwayError::TransportFailure(reason.to_string())));
                failed += 1;
            }
        }
        self.len.fetch_sub(failed, Ordering::AcqRel);
        failed
    }

    /// Number of unresolved calls.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Table capacity.
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn claim(&self, msg_id: u64) -> Option<Entry> {
        let (generation, index) = split(msg_id);
        let slot = self.slots.get(index as usize)?;

        let entry = {
            let mut slot = slot.lock();
            if slot.generation != generation {
                return None;
            }
            slot.entry.take()?
        };

        self.release(index);
        Some(entry)
    }

    fn release(&self, index: u32) {
        self.len.fetch_sub(1, Ordering::AcqRel);
        let mut free = self.free.lock();
        if !free.closed {
            free.indexes.push(index);
        }
    }
}

#[inline]
fn compose(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn split(msg_id: u64) -> (u32, u32) {
    ((msg_id >> 32) as u32, msg_id as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn response(msg_id: u64) -> Frame {
        Frame::new(msg_id, Bytes::new(), Bytes::from_static(b"ok"))
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let table = PendingTable::new(4);
        let (msg_id, rx) = table.register(far(), 60_000).unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.complete(msg_id, Ok(response(msg_id))));
        assert!(table.is_empty());

        let frame = rx.await.unwrap().unwrap();
        assert_eq!(frame.msg_id(), msg_id);
    }

    #[tokio::test]
    async fn test_ids_unique_while_outstanding() {
        let table = PendingTable::new(16);
        let mut ids: Vec<u64> = (0..16)
            .map(|_| table.register(far(), 1).unwrap().0)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_ne!(ids[0], 0, "id 0 is reserved for login");
    }

    #[test]
    fn test_capacity_exhausted() {
        let table = PendingTable::new(2);
        let _a = table.register(far(), 1).unwrap();
        let _b = table.register(far(), 1).unwrap();

        let err = table.register(far(), 1).err().unwrap();
        assert!(matches!(err, HighwayError::TooManyPending(2)));
    }

    #[tokio::test]
    async fn test_first_writer_wins() {
        let table = PendingTable::new(4);
        let (msg_id, rx) = table.register(far(), 50).unwrap();

        assert!(table.expire(msg_id));
        assert!(!table.complete(msg_id, Ok(response(msg_id))));
        assert!(!table.expire(msg_id));

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            HighwayError::RequestTimeout { timeout_ms: 50, .. }
        ));
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let table = PendingTable::new(4);
        assert!(!table.complete(12345, Ok(response(12345))));
        assert!(!table.complete(u64::MAX, Ok(response(0))));
    }

    #[tokio::test]
    async fn test_slot_reuse_rejects_stale_id() {
        let table = PendingTable::new(1);
        let (old_id, _old_rx) = table.register(far(), 1).unwrap();
        assert!(table.expire(old_id));

        let (new_id, new_rx) = table.register(far(), 1).unwrap();
        assert_eq!(old_id as u32, new_id as u32, "same slot");
        assert_ne!(old_id, new_id);

        // Late response for the expired call must not resolve the new one.
        assert!(!table.complete(old_id, Ok(response(old_id))));
        assert!(table.complete(new_id, Ok(response(new_id))));
        assert_eq!(new_rx.await.unwrap().unwrap().msg_id(), new_id);
    }

    #[tokio::test]
    async fn test_expire_due() {
        let table = PendingTable::new(8);
        let now = Instant::now();
        let (_, due_rx) = table.register(now, 10).unwrap();
        let (later, _later_rx) = table.register(far(), 10).unwrap();

        assert_eq!(table.expire_due(now), 1);
        assert_eq!(table.len(), 1);
        assert!(matches!(
            due_rx.await.unwrap(),
            Err(HighwayError::RequestTimeout { .. })
        ));
        assert!(table.complete(later, Ok(response(later))));
    }

    #[tokio::test]
    async fn test_close_fans_out_transport_failure() {
        let table = PendingTable::new(8);
        let receivers: Vec<_> = (0..5)
            .map(|_| table.register(far(), 1).unwrap().1)
            .collect();

        assert_eq!(table.close("peer reset"), 5);
        assert!(table.is_empty());
        assert_eq!(table.close("again"), 0);

        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, HighwayError::TransportFailure(ref m) if m == "peer reset"));
        }

        let err = table.register(far(), 1).err().unwrap();
        assert!(matches!(err, HighwayError::TransportFailure(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolution_race_resolves_exactly_once() {
        let table = Arc::new(PendingTable::new(1024));

        for _ in 0..200 {
            let (msg_id, rx) = table.register(Instant::now(), 1).unwrap();

            let responder = {
                let table = table.clone();
                tokio::spawn(async move { table.complete(msg_id, Ok(response(msg_id))) })
            };
            let expirer = {
                let table = table.clone();
                tokio::spawn(async move { table.expire(msg_id) })
            };
            let sweeper = {
                let table = table.clone();
                tokio::spawn(async move { table.expire_due(Instant::now()) == 1 })
            };

            let wins = [
                responder.await.unwrap(),
                expirer.await.unwrap(),
                sweeper.await.unwrap(),
            ];
            assert_eq!(wins.iter().filter(|w| **w).count(), 1);
            assert!(rx.await.is_ok());
        }
        assert!(table.is_empty());
    }
}
