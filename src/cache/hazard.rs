//! Hazard references.
//!
//! A session publishes the id of every page it is using in its own slots of
//! a shared table. An evictor that has locked a page's reference scans the
//! table and backs off if any slot names the page. Publication and the
//! reader's re-check of the reference state are both sequentially
//! consistent, so either the reader sees the lock or the evictor sees the
//! hazard.

use super::Cache;
use crate::btree::page::{Page, PageId};
use crate::storage::error::{StorageError, StorageResult};
use log::trace;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const EMPTY: u64 = 0;

pub struct HazardTable {
    slots: Box<[AtomicU64]>,
    per_session: usize,
}

impl HazardTable {
    pub fn new(sessions: usize, per_session: usize) -> Self {
        Self {
            slots: (0..sessions * per_session)
                .map(|_| AtomicU64::new(EMPTY))
                .collect(),
            per_session,
        }
    }

    fn range(&self, session: u32) -> std::ops::Range<usize> {
        let start = (session as usize - 1) * self.per_session;
        start..start + self.per_session
    }

    /// Publish a hazard reference for `page` in one of `session`'s slots.
    pub fn set(&self, session: u32, page: PageId) -> StorageResult<usize> {
        for i in self.range(session) {
            if self.slots[i]
                .compare_exchange(EMPTY, page.0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                trace!("session {} hazard slot {} = {:?}", session, i, page);
                return Ok(i);
            }
        }
        Err(StorageError::HazardTableFull {
            session,
            max: self.per_session,
        })
    }

    pub fn clear(&self, slot: usize) {
        self.slots[slot].store(EMPTY, Ordering::SeqCst);
    }

    /// True if any session holds a hazard reference for `page`.
    pub fn is_held(&self, page: PageId) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.load(Ordering::SeqCst) == page.0)
    }

    pub fn held_by(&self, session: u32) -> usize {
        self.range(session)
            .filter(|&i| self.slots[i].load(Ordering::Acquire) != EMPTY)
            .count()
    }

    /// Clear everything `session` still holds, returning how many there were.
    pub fn clear_session(&self, session: u32) -> usize {
        let mut cleared = 0;
        for i in self.range(session) {
            if self.slots[i].swap(EMPTY, Ordering::SeqCst) != EMPTY {
                cleared += 1;
            }
        }
        cleared
    }
}

impl fmt::Debug for HazardTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held = self
            .slots
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) != EMPTY)
            .count();
        f.debug_struct("HazardTable")
            .field("slots", &self.slots.len())
            .field("held", &held)
            .finish()
    }
}

/// A resident page protected by a hazard reference. Dropping the handle
/// releases the reference.
pub struct PageHandle {
    cache: Cache,
    slot: usize,
    page: Arc<Page>,
}

impl PageHandle {
    pub(crate) fn new(cache: Cache, slot: usize, page: Arc<Page>) -> Self {
        Self { cache, slot, page }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.cache.hazard().clear(self.slot);
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("page", &self.page.id())
            .field("slot", &self.slot)
            .finish()
    }
}
