use crate::btree::BTree;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cell::{Cell, CellPayload};
use bytes::Bytes;
use std::sync::OnceLock;

/// A row-store key, instantiated from its on-page cell on first use.
///
/// Keys stored inline and unencoded are set at decode time and point into
/// the page image. Encoded and overflow keys stay unset until a search needs
/// them; the first thread to finish building one installs it and any racing
/// thread adopts that copy.
#[derive(Debug)]
pub struct RowKey {
    cell: Option<Cell>,
    key: OnceLock<Bytes>,
}

impl RowKey {
    pub fn from_bytes(key: Bytes) -> Self {
        Self {
            cell: None,
            key: OnceLock::from(key),
        }
    }

    pub fn from_cell(cell: Cell, encoded: bool) -> Self {
        let key = OnceLock::new();
        if let CellPayload::Key(bytes) = &cell.payload {
            if !encoded {
                let _ = key.set(bytes.clone());
            }
        }
        Self {
            cell: Some(cell),
            key,
        }
    }

    /// The on-page cell, if this key came from a disk image.
    pub fn cell(&self) -> Option<&Cell> {
        self.cell.as_ref()
    }

    pub fn is_instantiated(&self) -> bool {
        self.key.get().is_some()
    }

    pub fn get(&self, tree: &BTree) -> StorageResult<Bytes> {
        if let Some(key) = self.key.get() {
            return Ok(key.clone());
        }
        let cell = self
            .cell
            .as_ref()
            .ok_or_else(|| StorageError::corruption("row key has neither bytes nor a cell"))?;
        let built = tree.instantiate_key(&cell.payload)?;
        Ok(self.key.get_or_init(|| built).clone())
    }

    pub fn memsize(&self) -> usize {
        std::mem::size_of::<Self>()
            + match (self.key.get(), &self.cell) {
                (Some(key), None) => key.len(),
                _ => 0,
            }
    }
}
