//! Per-page modification state.
//!
//! A page grows a modify block the first time it changes. The write
//! generation is the optimistic concurrency token: a search captures it, and
//! the serialized modify step refuses to run if it moved. The disk
//! generation records which write generation the last successful
//! reconciliation captured, so a page is dirty while the two differ.

use crate::storage::disk::BlockAddr;
use crate::storage::error::{StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

/// An overflow item written by a previous reconciliation.
#[derive(Debug, Clone)]
pub struct TrackedOverflow {
    pub data: Bytes,
    pub addr: BlockAddr,
}

/// Objects owned by the page's last reconciliation.
#[derive(Debug, Default)]
pub struct TrackList {
    /// Overflow items referenced by the last written image.
    pub overflow: Vec<TrackedOverflow>,
    /// Blocks from the original image already released.
    pub freed: HashSet<BlockAddr>,
}

impl TrackList {
    pub fn find_overflow(&self, data: &[u8]) -> Option<BlockAddr> {
        self.overflow
            .iter()
            .find(|t| t.data.as_ref() == data)
            .map(|t| t.addr)
    }
}

#[derive(Debug, Default)]
pub struct PageModify {
    write_gen: AtomicU32,
    disk_gen: AtomicU32,
    serial: Mutex<()>,
    track: Mutex<TrackList>,
}

impl PageModify {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_gen(&self) -> u32 {
        self.write_gen.load(Ordering::Acquire)
    }

    pub fn disk_gen(&self) -> u32 {
        self.disk_gen.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.write_gen() != self.disk_gen()
    }

    /// Run a modification if the page is unchanged since `expected` was
    /// captured, then advance the write generation.
    pub fn serialize<R>(&self, expected: u32, f: impl FnOnce() -> R) -> StorageResult<R> {
        let _guard = self.serial.lock();
        let found = self.write_gen.load(Ordering::Acquire);
        if found != expected {
            return Err(StorageError::WriteConflict { expected, found });
        }
        let result = f();
        self.write_gen.store(found.wrapping_add(1), Ordering::Release);
        Ok(result)
    }

    /// Record a change that does not race with searches, such as a child
    /// page moving to a new address.
    pub fn mark_dirty(&self) {
        let _guard = self.serial.lock();
        let gen = self.write_gen.load(Ordering::Acquire);
        self.write_gen.store(gen.wrapping_add(1), Ordering::Release);
    }

    /// The page was written as of write generation `gen`.
    pub fn mark_clean(&self, gen: u32) {
        self.disk_gen.store(gen, Ordering::Release);
    }

    pub fn track(&self) -> MutexGuard<'_, TrackList> {
        self.track.lock()
    }
}
