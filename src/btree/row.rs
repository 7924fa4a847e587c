//! Row-store reads and modifications.

use crate::btree::insert::{choose_depth, InsertKey, InsertNode, InsertSearch};
use crate::btree::search::{RowPos, RowSearch};
use crate::btree::update::{push_update, Update};
use crate::btree::BTree;
use crate::session::Session;
use crate::storage::error::{StorageError, StorageResult};
use bytes::Bytes;
use log::trace;
use std::sync::Arc;
use std::thread;

impl BTree {
    pub fn get(self: &Arc<Self>, session: &Session, key: &[u8]) -> StorageResult<Bytes> {
        let search = self.row_search(session, key)?;
        self.row_value(&search)?.ok_or(StorageError::NotFound)
    }

    pub fn put(self: &Arc<Self>, session: &Session, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.row_modify(session, key, Some(value))
    }

    /// Fails with `NotFound` if the key has no live value.
    pub fn remove(self: &Arc<Self>, session: &Session, key: &[u8]) -> StorageResult<()> {
        self.row_modify(session, key, None)
    }

    fn row_modify(
        self: &Arc<Self>,
        session: &Session,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> StorageResult<()> {
        loop {
            let search = self.row_search(session, key)?;
            match self.row_apply(session, &search, key, value) {
                Err(e) if e.is_retryable() => {
                    trace!("{}: restarting row modify: {}", self.name(), e);
                    drop(search);
                    thread::yield_now();
                }
                result => return result,
            }
        }
    }

    /// The current value at a search position; `None` if absent or deleted.
    pub fn row_value(&self, search: &RowSearch) -> StorageResult<Option<Bytes>> {
        let leaf = search
            .page
            .row_leaf()
            .ok_or_else(|| StorageError::corruption("row search ended on a non-leaf page"))?;
        match &search.pos {
            RowPos::OnPage { slot } => match leaf.update_head(*slot) {
                Some(upd) => Ok(upd.value().cloned()),
                None => self.cell_value(leaf.rows[*slot].value.as_ref()),
            },
            RowPos::Insert { ins, .. } => Ok(ins
                .exact
                .as_ref()
                .and_then(|node| node.update())
                .and_then(|upd| upd.value().cloned())),
        }
    }

    fn row_is_live(search: &RowSearch) -> bool {
        let Some(leaf) = search.page.row_leaf() else {
            return false;
        };
        match &search.pos {
            // Row leaves never carry deleted cells.
            RowPos::OnPage { slot } => leaf.update_head(*slot).map_or(true, |u| !u.is_deleted()),
            RowPos::Insert { ins, .. } => ins
                .exact
                .as_ref()
                .and_then(|node| node.update())
                .is_some_and(|u| !u.is_deleted()),
        }
    }

    /// Apply a put (`Some`) or remove (`None`) at the position a search
    /// found, provided the leaf has not changed since.
    pub fn row_apply(
        &self,
        session: &Session,
        search: &RowSearch,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> StorageResult<()> {
        let page = &search.page;
        let leaf = page
            .row_leaf()
            .ok_or_else(|| StorageError::corruption("row search ended on a non-leaf page"))?;
        if value.is_none() && !Self::row_is_live(search) {
            return Err(StorageError::NotFound);
        }

        let value = value.map(|v| session.alloc(v));
        let modify = page.modify();
        let added = match &search.pos {
            RowPos::OnPage { slot } => {
                let list = leaf.update_list(*slot);
                modify
                    .serialize(search.write_gen, || push_update(list, value))?
                    .memsize()
            }
            RowPos::Insert {
                ins: InsertSearch {
                    exact: Some(node), ..
                },
                ..
            } => modify
                .serialize(search.write_gen, || push_update(&node.upd, value))?
                .memsize(),
            RowPos::Insert { list, ins } => {
                let node = Arc::new(InsertNode::new(
                    InsertKey::Row(session.alloc(key)),
                    choose_depth(),
                    Update::new(value, None),
                ));
                let size = node.memsize() + node.update().map_or(0, |u| u.memsize());
                let head = leaf.insert_list(*list);
                modify.serialize(search.write_gen, || head.splice(node, &ins.stack))?;
                size
            }
        };

        page.add_footprint(added);
        session.cache().account_modify(added);
        Ok(())
    }
}
