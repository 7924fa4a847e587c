use crate::storage::disk::{BlockAddr, BlockStore, TreeMeta};
use crate::storage::error::{StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct MemoryBlocks {
    blocks: HashMap<u32, Bytes>,
    next_addr: u32,
    meta: Option<TreeMeta>,
}

/// Map-backed block storage.
///
/// Addresses are never reused, which makes stale references easy to spot.
/// Read and write failures can be switched on to exercise error paths.
#[derive(Debug)]
pub struct MemoryBlockStore {
    inner: Mutex<MemoryBlocks>,
    allocation_size: u32,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBlockStore {
    pub fn new(allocation_size: u32) -> Self {
        Self {
            inner: Mutex::new(MemoryBlocks::default()),
            allocation_size,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Flip a byte inside a stored block.
    pub fn corrupt(&self, addr: BlockAddr, offset: usize) {
        let mut inner = self.inner.lock();
        if let Some(block) = inner.blocks.get_mut(&addr.addr) {
            let mut data = block.to_vec();
            if let Some(byte) = data.get_mut(offset) {
                *byte ^= 0xff;
            }
            *block = Bytes::from(data);
        }
    }

    pub fn io_counts(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
        )
    }

    pub fn live_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn contains(&self, addr: BlockAddr) -> bool {
        self.inner.lock().blocks.contains_key(&addr.addr)
    }

    fn injected(op: &str) -> StorageError {
        StorageError::Io(io::Error::other(format!("injected {op} failure")))
    }
}

impl BlockStore for MemoryBlockStore {
    fn allocation_size(&self) -> u32 {
        self.allocation_size
    }

    fn read(&self, addr: BlockAddr) -> StorageResult<Bytes> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::injected("read"));
        }
        let inner = self.inner.lock();
        let block = inner
            .blocks
            .get(&addr.addr)
            .ok_or_else(|| StorageError::corruption(format!("read of unknown block {addr}")))?;
        if block.len() != addr.size as usize {
            return Err(StorageError::corruption(format!(
                "block {addr} holds {} bytes",
                block.len()
            )));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(block.clone())
    }

    fn write(&self, image: &[u8]) -> StorageResult<BlockAddr> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("write"));
        }
        if image.is_empty() || image.len() % self.allocation_size as usize != 0 {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unaligned image of {} bytes", image.len()),
            )));
        }
        let mut inner = self.inner.lock();
        let addr = BlockAddr::new(inner.next_addr, image.len() as u32);
        inner.next_addr += image.len() as u32 / self.allocation_size;
        inner.blocks.insert(addr.addr, Bytes::copy_from_slice(image));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn write_at(&self, addr: BlockAddr, image: &[u8]) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("write"));
        }
        let mut inner = self.inner.lock();
        match inner.blocks.get_mut(&addr.addr) {
            Some(block) if block.len() == image.len() => {
                *block = Bytes::copy_from_slice(image);
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(StorageError::corruption(format!(
                "overwrite of unknown or mismatched block {addr}"
            ))),
        }
    }

    fn free(&self, addr: BlockAddr) -> StorageResult<()> {
        match self.inner.lock().blocks.remove(&addr.addr) {
            Some(_) => Ok(()),
            None => Err(StorageError::corruption(format!(
                "free of unknown block {addr}"
            ))),
        }
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn load_meta(&self) -> StorageResult<Option<TreeMeta>> {
        Ok(self.inner.lock().meta.clone())
    }

    fn store_meta(&self, meta: &TreeMeta) -> StorageResult<()> {
        self.inner.lock().meta = Some(meta.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses_are_not_reused() {
        let store = MemoryBlockStore::new(512);
        let a = store.write(&[1u8; 1024]).unwrap();
        store.free(a).unwrap();
        let b = store.write(&[2u8; 512]).unwrap();
        assert_eq!(a.addr, 0);
        assert_eq!(b.addr, 2);
        assert!(store.read(a).is_err());
        assert!(store.free(a).is_err());
    }

    #[test]
    fn test_injected_failures() {
        let store = MemoryBlockStore::new(512);
        let a = store.write(&[1u8; 512]).unwrap();

        store.fail_reads(true);
        assert!(matches!(store.read(a), Err(StorageError::Io(_))));
        store.fail_reads(false);
        assert_eq!(store.read(a).unwrap()[0], 1);

        store.fail_writes(true);
        assert!(store.write(&[0u8; 512]).is_err());
        assert_eq!(store.live_blocks(), 1);
    }

    #[test]
    fn test_corrupt_flips_a_byte() {
        let store = MemoryBlockStore::new(512);
        let a = store.write(&[0u8; 512]).unwrap();
        store.corrupt(a, 10);
        assert_eq!(store.read(a).unwrap()[10], 0xff);
    }
}
