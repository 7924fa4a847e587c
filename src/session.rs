//! Sessions: the per-thread context for tree operations.

use crate::btree::page::Page;
use crate::btree::reference::PageRef;
use crate::btree::BTree;
use crate::cache::{Cache, PageHandle};
use crate::storage::buffer::SessionBuffer;
use crate::storage::error::StorageResult;
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// A session owns a range of hazard reference slots and an allocation
/// buffer for the keys and values it writes into pages. Use one session per
/// thread.
pub struct Session {
    cache: Cache,
    id: u32,
    buffer: Mutex<SessionBuffer>,
}

impl Session {
    pub(crate) fn new(cache: Cache) -> StorageResult<Self> {
        let id = cache.claim_session()?;
        let config = cache.config();
        let buffer = SessionBuffer::new(config.data_update_min, config.data_update_max);
        debug!("session {} opened", id);
        Ok(Self {
            cache,
            id,
            buffer: Mutex::new(buffer),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Acquire the page `pref` references, reading it in if necessary.
    pub fn page_in(
        &self,
        tree: &Arc<BTree>,
        pref: &Arc<PageRef>,
        parent: &Weak<Page>,
    ) -> StorageResult<PageHandle> {
        self.cache.page_in(self.id, tree, pref, parent)
    }

    /// Copy `data` into the session's allocation buffer.
    pub fn alloc(&self, data: &[u8]) -> Bytes {
        self.buffer.lock().alloc(data)
    }

    /// Hazard references this session currently holds.
    pub fn hazard_count(&self) -> usize {
        self.cache.hazard().held_by(self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let leaked = self.cache.hazard().clear_session(self.id);
        if leaked > 0 {
            warn!(
                "session {} closed holding {} hazard references",
                self.id, leaked
            );
        }
        self.cache.release_session(self.id);
        debug!("session {} closed", self.id);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}
