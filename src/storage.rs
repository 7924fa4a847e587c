//! Storage layer for vibetree.
//!
//! This module owns everything below the in-memory tree:
//!
//! - **page**: the on-disk page header, cell encoding and image verification
//! - **disk**: block stores addressed in allocation units
//! - **buffer**: per-session allocation chunks for values written into pages
//! - **error**: the error type shared by the whole crate

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;

pub use buffer::SessionBuffer;
pub use disk::{BlockAddr, BlockStore, FileBlockManager, MemoryBlockStore, TreeMeta};
pub use error::{StorageError, StorageResult};
pub use page::{PageHeader, PageType, PAGE_HEADER_SIZE};
