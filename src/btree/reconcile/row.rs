use super::{Reconciler, UnitStart};
use crate::btree::insert::InsertHead;
use crate::btree::page::{RowInternal, RowLeaf};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cell;

impl<'a> Reconciler<'a> {
    pub(super) fn row_internal(&mut self, intl: &'a RowInternal) -> StorageResult<()> {
        for child in &intl.children {
            let addr = child.pref.addr();
            if !addr.is_valid() {
                return Err(StorageError::busy(format!(
                    "child of page {:?} has not been written",
                    self.page.id()
                )));
            }
            let offset = self.begin_unit();
            match child.key.cell() {
                Some(key) => self.raw_cell(key),
                None => {
                    let key = child.key.get(self.tree)?;
                    self.key_cell(&key)?;
                }
            }
            cell::encode_addr(&mut self.buf, addr, None);
            self.end_unit(offset, UnitStart::RowKey(&child.key), 2);
        }
        Ok(())
    }

    /// Rows in key order: keys smaller than every row first, then each row
    /// followed by the keys inserted after it.
    pub(super) fn row_leaf(&mut self, leaf: &'a RowLeaf) -> StorageResult<()> {
        if let Some(head) = leaf.insert_head(leaf.smallest_list()) {
            self.row_inserts(head)?;
        }

        for (slot, row) in leaf.rows.iter().enumerate() {
            match leaf.update_head(slot) {
                None => {
                    let offset = self.begin_unit();
                    let mut entries = 1;
                    match row.key.cell() {
                        Some(key) => self.raw_cell(key),
                        None => {
                            let key = row.key.get(self.tree)?;
                            self.key_cell(&key)?;
                        }
                    }
                    if let Some(value) = &row.value {
                        self.raw_cell(value);
                        entries += 1;
                    }
                    self.end_unit(offset, UnitStart::RowKey(&row.key), entries);
                }
                Some(upd) => {
                    if let Some(value) = &row.value {
                        self.supersede(value);
                    }
                    match upd.value() {
                        Some(value) => {
                            let offset = self.begin_unit();
                            match row.key.cell() {
                                Some(key) => self.raw_cell(key),
                                None => {
                                    let key = row.key.get(self.tree)?;
                                    self.key_cell(&key)?;
                                }
                            }
                            let entries = if value.is_empty() {
                                1
                            } else {
                                self.value_cell(value, 1)?;
                                2
                            };
                            self.end_unit(offset, UnitStart::RowKey(&row.key), entries);
                        }
                        None => {
                            // The row is gone, and with it an overflow key.
                            if let Some(key) = row.key.cell() {
                                self.supersede(key);
                            }
                        }
                    }
                }
            }

            if let Some(head) = leaf.insert_head(slot) {
                self.row_inserts(head)?;
            }
        }
        Ok(())
    }

    fn row_inserts(&mut self, head: &InsertHead) -> StorageResult<()> {
        for node in head.iter() {
            let (Some(key), Some(upd)) = (node.key().row(), node.update()) else {
                continue;
            };
            let Some(value) = upd.value() else {
                continue;
            };
            let offset = self.begin_unit();
            self.key_cell(key)?;
            let entries = if value.is_empty() {
                1
            } else {
                self.value_cell(value, 1)?;
                2
            };
            self.end_unit(offset, UnitStart::Key(key.clone()), entries);
        }
        Ok(())
    }
}
