//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur anywhere in the page lifecycle.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted page: {0}")]
    Corruption(String),

    #[error("Key or record not found")]
    NotFound,

    #[error("Page write generation changed: expected {expected}, found {found}")]
    WriteConflict { expected: u32, found: u32 },

    #[error("Page is busy: {0}")]
    Busy(String),

    #[error("{table} request table is full ({slots} slots)")]
    RequestTableFull { table: &'static str, slots: usize },

    #[error("Session {session} has no free hazard reference slots (max: {max})")]
    HazardTableFull { session: u32, max: usize },

    #[error("Session limit reached (max: {max})")]
    SessionLimit { max: usize },

    #[error("Item of {size} bytes is larger than the maximum supported object size")]
    ItemTooLarge { size: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Bulk load failed: {0}")]
    BulkLoad(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Connection is closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        StorageError::Corruption(reason.into())
    }

    pub(crate) fn busy(reason: impl Into<String>) -> Self {
        StorageError::Busy(reason.into())
    }

    /// True for the races that a caller recovers from by starting over.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::WriteConflict { .. } | StorageError::Busy(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StorageError::WriteConflict {
            expected: 1,
            found: 2
        }
        .is_retryable());
        assert!(StorageError::busy("hazard").is_retryable());
        assert!(!StorageError::NotFound.is_retryable());
        assert!(!StorageError::corruption("bad checksum").is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(err.to_string().contains("short read"));
    }
}
