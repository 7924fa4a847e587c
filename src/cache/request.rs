//! Fixed-size request tables shared between sessions and a server thread.
//!
//! A session claims a free slot, fills in its request and waits on the
//! request's completion. The server scans the table, handles whatever it
//! finds and releases the slot.

use crate::storage::error::{StorageError, StorageResult};
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const FREE: u32 = 0;

struct Slot<T> {
    session: AtomicU32,
    /// Submissions to this slot so far, and the request waiting in it.
    body: Mutex<(u64, Option<T>)>,
}

/// Where a submitted request sits: its slot and that slot's submission
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub slot: usize,
    seq: u64,
}

pub struct RequestTable<T> {
    name: &'static str,
    slots: Box<[Slot<T>]>,
}

impl<T> RequestTable<T> {
    pub fn new(name: &'static str, slots: usize) -> Self {
        Self {
            name,
            slots: (0..slots)
                .map(|_| Slot {
                    session: AtomicU32::new(FREE),
                    body: Mutex::new((0, None)),
                })
                .collect(),
        }
    }

    pub fn submit(&self, session: u32, request: T) -> StorageResult<Ticket> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .session
                .compare_exchange(FREE, session, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let mut body = slot.body.lock();
                body.0 += 1;
                body.1 = Some(request);
                trace!("{} request from session {} in slot {}", self.name, session, i);
                return Ok(Ticket { slot: i, seq: body.0 });
            }
        }
        Err(StorageError::RequestTableFull {
            table: self.name,
            slots: self.slots.len(),
        })
    }

    /// Take every filled-in request. Slots stay claimed until released.
    pub fn take_pending(&self) -> Vec<(usize, T)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.session.load(Ordering::SeqCst) != FREE)
            .filter_map(|(i, slot)| slot.body.lock().1.take().map(|req| (i, req)))
            .collect()
    }

    /// Take back a request the server has not picked up yet, freeing its
    /// slot. Returns false once the server owns the request.
    pub fn withdraw(&self, ticket: Ticket) -> bool {
        let slot = &self.slots[ticket.slot];
        let mut body = slot.body.lock();
        if body.0 != ticket.seq || body.1.take().is_none() {
            return false;
        }
        slot.session.store(FREE, Ordering::Release);
        true
    }

    pub fn release(&self, slot: usize) {
        self.slots[slot].session.store(FREE, Ordering::Release);
    }

    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.session.load(Ordering::Acquire) != FREE)
            .count()
    }
}

/// The result of a request, handed back to the waiting session.
#[derive(Debug, Default)]
pub struct Completion {
    result: Mutex<Option<StorageResult<()>>>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self, result: StorageResult<()>) {
        *self.result.lock() = Some(result);
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for the result.
    pub fn wait_for(&self, timeout: Duration) -> Option<StorageResult<()>> {
        let mut result = self.result.lock();
        if result.is_none() {
            self.cond.wait_for(&mut result, timeout);
        }
        result.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_full_table_rejects() {
        let table = RequestTable::new("read", 2);
        table.submit(1, "a").unwrap();
        table.submit(2, "b").unwrap();
        assert!(matches!(
            table.submit(3, "c"),
            Err(StorageError::RequestTableFull {
                table: "read",
                slots: 2
            })
        ));
    }

    #[test]
    fn test_take_then_release() {
        let table = RequestTable::new("evict", 4);
        let slot = table.submit(1, 10).unwrap().slot;
        table.submit(2, 20).unwrap();

        let pending = table.take_pending();
        assert_eq!(pending.len(), 2);
        assert!(table.take_pending().is_empty());
        assert_eq!(table.in_use(), 2);

        table.release(slot);
        assert_eq!(table.in_use(), 1);
        assert_eq!(table.submit(3, 30).unwrap().slot, slot);
    }

    #[test]
    fn test_completion_wakes_waiter() {
        let done = Completion::new();
        let waiter = {
            let done = done.clone();
            thread::spawn(move || done.wait_for(Duration::from_secs(10)))
        };
        done.complete(Err(StorageError::Closed));
        assert!(matches!(waiter.join().unwrap(), Some(Err(StorageError::Closed))));
    }

    #[test]
    fn test_wait_times_out_without_result() {
        let done = Completion::new();
        assert!(done.wait_for(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_withdraw_before_pickup() {
        let table = RequestTable::new("read", 2);
        let ticket = table.submit(1, 10).unwrap();
        assert!(table.withdraw(ticket));
        assert_eq!(table.in_use(), 0);
        assert!(table.take_pending().is_empty());
    }

    #[test]
    fn test_withdraw_after_pickup_leaves_slot_to_server() {
        let table = RequestTable::new("read", 2);
        let ticket = table.submit(1, 10).unwrap();
        assert_eq!(table.take_pending(), vec![(ticket.slot, 10)]);
        assert!(!table.withdraw(ticket));
        assert_eq!(table.in_use(), 1);
        table.release(ticket.slot);
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn test_withdraw_ignores_a_reused_slot() {
        let table = RequestTable::new("evict", 1);
        let first = table.submit(1, 10).unwrap();
        assert_eq!(table.take_pending(), vec![(first.slot, 10)]);
        table.release(first.slot);

        let second = table.submit(2, 20).unwrap();
        assert_eq!(second.slot, first.slot);
        assert!(!table.withdraw(first));
        assert_eq!(table.take_pending(), vec![(second.slot, 20)]);
    }
}
