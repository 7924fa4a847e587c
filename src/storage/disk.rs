//! Block storage.
//!
//! Pages live in blocks addressed by allocation unit. The [`BlockStore`]
//! trait is everything the cache and reconciliation need from the file
//! layer; [`FileBlockManager`] implements it over a single file and
//! [`MemoryBlockStore`] over a map.

pub mod block_manager;
pub mod memory;

pub use block_manager::FileBlockManager;
pub use memory::MemoryBlockStore;

use crate::config::TreeConfig;
use crate::storage::error::StorageResult;
use bytes::Bytes;
use std::fmt;

/// Bytes reserved at the start of a file for the description record.
pub const DESC_SECTOR_SIZE: u64 = 512;

pub const ADDR_INVALID: u32 = u32::MAX;

/// A block's address (in allocation units) and size (in bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockAddr {
    pub addr: u32,
    pub size: u32,
}

impl BlockAddr {
    pub const INVALID: BlockAddr = BlockAddr {
        addr: ADDR_INVALID,
        size: 0,
    };

    pub fn new(addr: u32, size: u32) -> Self {
        Self { addr, size }
    }

    pub fn is_valid(&self) -> bool {
        self.addr != ADDR_INVALID
    }

    pub(crate) fn pack(&self) -> u64 {
        (self.addr as u64) << 32 | self.size as u64
    }

    pub(crate) fn unpack(v: u64) -> Self {
        Self {
            addr: (v >> 32) as u32,
            size: v as u32,
        }
    }

    pub fn file_offset(&self, allocation_size: u32) -> u64 {
        DESC_SECTOR_SIZE + self.addr as u64 * allocation_size as u64
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}/{}", self.addr, self.size)
        } else {
            f.write_str("[invalid]")
        }
    }
}

/// Tree-level metadata persisted with the blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMeta {
    pub root: BlockAddr,
    pub lsn: u64,
    pub config: TreeConfig,
}

pub trait BlockStore: Send + Sync + fmt::Debug {
    fn allocation_size(&self) -> u32;

    /// Read a whole block.
    fn read(&self, addr: BlockAddr) -> StorageResult<Bytes>;

    /// Write an allocation-aligned image to a newly allocated block.
    fn write(&self, image: &[u8]) -> StorageResult<BlockAddr>;

    /// Overwrite an existing block of the same size.
    fn write_at(&self, addr: BlockAddr, image: &[u8]) -> StorageResult<()>;

    fn free(&self, addr: BlockAddr) -> StorageResult<()>;

    fn sync(&self) -> StorageResult<()>;

    fn load_meta(&self) -> StorageResult<Option<TreeMeta>>;

    fn store_meta(&self, meta: &TreeMeta) -> StorageResult<()>;
}
