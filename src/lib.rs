pub mod btree;
pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod session;
pub mod storage;

pub use btree::{BTree, TreeId, TreeOptions};
pub use cache::{Cache, CacheStats, PageHandle};
pub use config::{ConnectionConfig, TreeConfig, TreeType};
pub use connection::Connection;
pub use session::Session;
pub use storage::{StorageError, StorageResult};
