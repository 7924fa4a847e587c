//! Page references.
//!
//! Every child slot of an internal page, and every tree root, owns a
//! [`PageRef`]. Its state decides who may touch the page:
//!
//! ```text
//! Disk --read server--> Reading --> Mem --evictor--> Locked --> Disk | Mem
//! ```
//!
//! Only the read server leaves `Disk`, only an evictor holding exclusive
//! access leaves `Mem` through `Locked`. The page pointer is stored before
//! the state that makes it visible.

use crate::btree::page::{Page, PageId};
use crate::storage::disk::BlockAddr;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefState {
    Disk = 0,
    Locked = 1,
    Mem = 2,
    Reading = 3,
}

impl RefState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RefState::Disk,
            1 => RefState::Locked,
            2 => RefState::Mem,
            3 => RefState::Reading,
            other => panic!("page reference in undefined state {other}"),
        }
    }
}

pub struct PageRef {
    state: AtomicU8,
    addr: AtomicU64,
    page: RwLock<Option<Arc<Page>>>,
}

impl PageRef {
    pub fn on_disk(addr: BlockAddr) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(RefState::Disk as u8),
            addr: AtomicU64::new(addr.pack()),
            page: RwLock::new(None),
        })
    }

    /// A reference with no block yet, for pages created in memory.
    pub fn unwritten() -> Arc<Self> {
        Self::on_disk(BlockAddr::INVALID)
    }

    pub fn state(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// State read ordered against hazard reference publication.
    pub(crate) fn state_seqcst(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn addr(&self) -> BlockAddr {
        BlockAddr::unpack(self.addr.load(Ordering::Acquire))
    }

    pub(crate) fn set_addr(&self, addr: BlockAddr) {
        self.addr.store(addr.pack(), Ordering::Release);
    }

    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.read().clone()
    }

    pub fn page_id(&self) -> Option<PageId> {
        self.page.read().as_ref().map(|p| p.id())
    }

    /// Claim an on-disk reference for reading.
    pub(crate) fn try_begin_read(&self) -> bool {
        self.state
            .compare_exchange(
                RefState::Disk as u8,
                RefState::Reading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn finish_read(&self, page: Arc<Page>) {
        *self.page.write() = Some(page);
        self.state.store(RefState::Mem as u8, Ordering::Release);
    }

    pub(crate) fn abort_read(&self) {
        self.state.store(RefState::Disk as u8, Ordering::Release);
    }

    /// Make a page built in memory resident.
    pub(crate) fn install(&self, page: Arc<Page>) {
        self.finish_read(page);
    }

    /// Take exclusive access to a resident page.
    ///
    /// Fails if the reference is not resident or no longer holds `page`.
    /// Callers must still check for hazard references afterwards.
    pub(crate) fn try_lock(&self, page: PageId) -> bool {
        if self
            .state
            .compare_exchange(
                RefState::Mem as u8,
                RefState::Locked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }
        if self.page_id() != Some(page) {
            self.unlock();
            return false;
        }
        true
    }

    pub(crate) fn unlock(&self) {
        self.state.store(RefState::Mem as u8, Ordering::Release);
    }

    /// Drop the resident page; the block at `addr()` is its image.
    pub(crate) fn evict(&self) {
        *self.page.write() = None;
        self.state.store(RefState::Disk as u8, Ordering::Release);
    }

    /// Swap in a replacement page, such as the internal page of a split.
    pub(crate) fn replace(&self, page: Arc<Page>) {
        *self.page.write() = Some(page);
        self.state.store(RefState::Mem as u8, Ordering::Release);
    }
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("state", &self.state())
            .field("addr", &self.addr())
            .field("page", &self.page_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_claim_is_exclusive() {
        let pref = PageRef::on_disk(BlockAddr::new(1, 512));
        assert!(pref.try_begin_read());
        assert!(!pref.try_begin_read());
        assert_eq!(pref.state(), RefState::Reading);

        pref.abort_read();
        assert_eq!(pref.state(), RefState::Disk);
        assert!(pref.page().is_none());
    }

    #[test]
    fn test_lock_requires_resident_state() {
        let pref = PageRef::unwritten();
        assert!(!pref.try_lock(PageId(1)));
        assert_eq!(pref.state(), RefState::Disk);
        assert!(!pref.addr().is_valid());
    }

    #[test]
    #[should_panic(expected = "undefined state")]
    fn test_undefined_state_aborts() {
        RefState::from_u8(9);
    }
}
