//! Column-store reads and modifications.
//!
//! Record numbers start at 1. Fixed-length stores hold one masked byte per
//! record and read deleted records as 0; variable-length stores report
//! deleted records as missing.

use crate::btree::insert::{choose_depth, InsertHead, InsertKey, InsertNode};
use crate::btree::page::PageKind;
use crate::btree::search::{ColPos, ColSearch};
use crate::btree::update::{push_update, Update};
use crate::btree::BTree;
use crate::config::TreeType;
use crate::session::Session;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cell::CellPayload;
use crate::storage::page::fix;
use bytes::Bytes;
use log::trace;
use std::sync::Arc;
use std::thread;

impl BTree {
    pub fn col_get(self: &Arc<Self>, session: &Session, recno: u64) -> StorageResult<Bytes> {
        if recno == 0 {
            return Err(StorageError::NotFound);
        }
        let search = self.col_search(session, recno)?;
        self.col_value(&search)?.ok_or(StorageError::NotFound)
    }

    /// Overwrite an existing record.
    pub fn col_put(self: &Arc<Self>, session: &Session, recno: u64, value: &[u8]) -> StorageResult<()> {
        let value = self.normalize(value)?;
        self.col_modify(session, recno, Some(&value))
    }

    pub fn col_remove(self: &Arc<Self>, session: &Session, recno: u64) -> StorageResult<()> {
        self.col_modify(session, recno, None)
    }

    /// Add a record after the last one, returning its record number.
    pub fn col_append(self: &Arc<Self>, session: &Session, value: &[u8]) -> StorageResult<u64> {
        let value = self.normalize(value)?;
        if !self.config().tree_type.is_column() {
            return Err(StorageError::InvalidConfig(format!(
                "{}: append to a row store",
                self.name()
            )));
        }
        let recno = self.allocate_recno();
        loop {
            let search = self.col_search(session, recno)?;
            // A leaf written since the allocation already covers the record
            // as a deleted entry; that is updated in place.
            if search.pos == ColPos::Missing {
                return Err(StorageError::corruption(format!(
                    "{}: appended record {} is in no leaf",
                    self.name(),
                    recno
                )));
            }
            match self.col_apply(session, &search, Some(&value)) {
                Ok(()) => return Ok(recno),
                Err(e) if e.is_retryable() => {
                    trace!("{}: restarting append of {}: {}", self.name(), recno, e);
                    drop(search);
                    thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn col_modify(
        self: &Arc<Self>,
        session: &Session,
        recno: u64,
        value: Option<&[u8]>,
    ) -> StorageResult<()> {
        if recno == 0 || recno > self.last_recno() {
            return Err(StorageError::NotFound);
        }
        loop {
            let search = self.col_search(session, recno)?;
            match self.col_apply(session, &search, value) {
                Err(e) if e.is_retryable() => {
                    trace!("{}: restarting modify of {}: {}", self.name(), recno, e);
                    drop(search);
                    thread::yield_now();
                }
                result => return result,
            }
        }
    }

    /// Fixed-length values are a single byte masked to the field width.
    pub(crate) fn normalize(&self, value: &[u8]) -> StorageResult<Vec<u8>> {
        match self.config().tree_type {
            TreeType::ColumnFixed { bitcnt } => match value {
                [byte] => Ok(vec![byte & fix::value_mask(bitcnt)]),
                _ => Err(StorageError::InvalidConfig(format!(
                    "fixed-length records hold one byte, got {}",
                    value.len()
                ))),
            },
            _ => Ok(value.to_vec()),
        }
    }

    /// The current value of the searched record; `None` if it is missing
    /// or deleted.
    pub fn col_value(&self, search: &ColSearch) -> StorageResult<Option<Bytes>> {
        let fixed = matches!(self.config().tree_type, TreeType::ColumnFixed { .. });
        if let Some(upd) = search.ins.exact.as_ref().and_then(|node| node.update()) {
            return Ok(match upd.value() {
                Some(value) => Some(value.clone()),
                None if fixed => Some(Bytes::from_static(&[0])),
                None => None,
            });
        }
        match (search.pos, search.page.kind()) {
            (ColPos::Fix { index }, PageKind::ColFixLeaf(leaf)) => {
                Ok(Some(Bytes::copy_from_slice(&[leaf.value(index)])))
            }
            (ColPos::Var { slot }, PageKind::ColVarLeaf(leaf)) => {
                self.cell_value(Some(&leaf.slots[slot].cell))
            }
            // A gap left between appended records.
            (ColPos::Append, _) if fixed && search.recno <= self.last_recno() => {
                Ok(Some(Bytes::from_static(&[0])))
            }
            (ColPos::Append | ColPos::Missing, _) => Ok(None),
            (pos, kind) => Err(StorageError::corruption(format!(
                "search position {:?} on a {} page",
                pos,
                kind.page_type()
            ))),
        }
    }

    fn col_is_live(&self, search: &ColSearch) -> bool {
        if let Some(upd) = search.ins.exact.as_ref().and_then(|node| node.update()) {
            return !upd.is_deleted();
        }
        match (search.pos, search.page.kind()) {
            (ColPos::Fix { .. }, _) => true,
            (ColPos::Var { slot }, PageKind::ColVarLeaf(leaf)) => {
                !matches!(leaf.slots[slot].cell.payload, CellPayload::Deleted)
            }
            _ => false,
        }
    }

    /// Apply a put (`Some`) or remove (`None`) at a searched record,
    /// provided the leaf has not changed since.
    pub fn col_apply(
        &self,
        session: &Session,
        search: &ColSearch,
        value: Option<&[u8]>,
    ) -> StorageResult<()> {
        let page = &search.page;
        let head: &InsertHead = match (search.pos, page.kind()) {
            (ColPos::Fix { .. }, PageKind::ColFixLeaf(leaf)) => leaf.update_list(),
            (ColPos::Var { slot }, PageKind::ColVarLeaf(leaf)) => leaf.update_list(slot),
            (ColPos::Append, PageKind::ColFixLeaf(leaf)) => leaf.append_list(),
            (ColPos::Append, PageKind::ColVarLeaf(leaf)) => leaf.append_list(),
            _ => return Err(StorageError::NotFound),
        };
        if value.is_none() && !self.col_is_live(search) {
            return Err(StorageError::NotFound);
        }

        let value = value.map(|v| session.alloc(v));
        let modify = page.modify();
        let added = match &search.ins.exact {
            Some(node) => modify
                .serialize(search.write_gen, || push_update(&node.upd, value))?
                .memsize(),
            None => {
                let node = Arc::new(InsertNode::new(
                    InsertKey::Recno(search.recno),
                    choose_depth(),
                    Update::new(value, None),
                ));
                let size = node.memsize() + node.update().map_or(0, |u| u.memsize());
                modify.serialize(search.write_gen, || head.splice(node, &search.ins.stack))?;
                size
            }
        };

        page.add_footprint(added);
        session.cache().account_modify(added);
        Ok(())
    }
}
