//! Bulk load into an empty tree.
//!
//! Rows or records are appended to the tree's single empty leaf as one long
//! insert list, with eviction of the tree switched off. Finishing the load
//! reconciles that leaf once, producing the whole leaf level and, when it
//! takes more than one page, a new internal root above it.

use crate::btree::insert::{choose_depth, InsertHead, InsertKey, InsertNode};
use crate::btree::page::PageKind;
use crate::btree::reconcile::RecOptions;
use crate::btree::update::Update;
use crate::btree::BTree;
use crate::cache::PageHandle;
use crate::session::Session;
use crate::storage::error::{StorageError, StorageResult};
use bytes::Bytes;
use log::info;
use std::sync::{Arc, Weak};

pub struct BulkLoad<'s> {
    tree: Arc<BTree>,
    session: &'s Session,
    leaf: Option<PageHandle>,
    records_per_page: Option<u64>,
    last_key: Option<Bytes>,
    count: u64,
}

fn not_empty(tree: &BTree) -> StorageError {
    StorageError::BulkLoad(format!("{} is not empty", tree.name()))
}

impl BTree {
    /// Start a bulk load. `records_per_page` caps the rows, records or
    /// repeat groups written to each leaf.
    pub fn bulk_load<'s>(
        self: &Arc<Self>,
        session: &'s Session,
        records_per_page: Option<u64>,
    ) -> StorageResult<BulkLoad<'s>> {
        if records_per_page == Some(0) {
            return Err(StorageError::InvalidConfig(
                "records_per_page must be non-zero".to_string(),
            ));
        }
        if self.root().addr().is_valid() || self.last_recno() != 0 {
            return Err(not_empty(self));
        }

        let root = session.page_in(self, self.root(), &Weak::new())?;
        let child = match root.child_refs().as_slice() {
            [child] => Arc::clone(child),
            _ => return Err(not_empty(self)),
        };
        if child.addr().is_valid() || child.page().is_none() {
            return Err(not_empty(self));
        }
        let leaf = session.page_in(self, &child, &Arc::downgrade(root.page()))?;
        drop(root);

        let empty = !leaf.is_dirty()
            && match leaf.kind() {
                PageKind::RowLeaf(leaf) => leaf.rows.is_empty(),
                PageKind::ColFixLeaf(leaf) => leaf.entries == 0,
                PageKind::ColVarLeaf(leaf) => leaf.slots.is_empty(),
                _ => false,
            };
        if !empty {
            return Err(not_empty(self));
        }

        self.set_no_eviction(true);
        leaf.set_bulk(true);
        info!("{}: bulk load started", self.name());
        Ok(BulkLoad {
            tree: Arc::clone(self),
            session,
            leaf: Some(leaf),
            records_per_page,
            last_key: None,
            count: 0,
        })
    }
}

impl<'s> BulkLoad<'s> {
    fn leaf(&self) -> StorageResult<&PageHandle> {
        self.leaf
            .as_ref()
            .ok_or_else(|| StorageError::BulkLoad("load already finished".to_string()))
    }

    fn append_node(&self, head: &InsertHead, node: InsertNode) -> StorageResult<()> {
        let leaf = self.leaf()?;
        let size = node.memsize() + node.update().map_or(0, |u| u.memsize());
        let node = Arc::new(node);
        leaf.modify()
            .serialize(leaf.write_gen(), || head.splice(node, &head.append_stack()))?;
        leaf.add_footprint(size);
        self.session.cache().account_modify(size);
        Ok(())
    }

    /// Add the next row; keys must arrive in strictly increasing order.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let leaf = self.leaf()?;
        let Some(row) = leaf.row_leaf() else {
            return Err(StorageError::BulkLoad(format!(
                "{} is not a row store",
                self.tree.name()
            )));
        };
        if self.last_key.as_ref().is_some_and(|last| last.as_ref() >= key) {
            return Err(StorageError::BulkLoad(format!(
                "key {:?} is out of order",
                String::from_utf8_lossy(key)
            )));
        }

        let key = self.session.alloc(key);
        let node = InsertNode::new(
            InsertKey::Row(key.clone()),
            choose_depth(),
            Update::new(Some(self.session.alloc(value)), None),
        );
        self.append_node(row.insert_list(row.smallest_list()), node)?;
        self.last_key = Some(key);
        self.count += 1;
        Ok(())
    }

    /// Add the next record, returning its record number.
    pub fn append(&mut self, value: &[u8]) -> StorageResult<u64> {
        let leaf = self.leaf()?;
        let head = match leaf.kind() {
            PageKind::ColFixLeaf(col) => col.append_list(),
            PageKind::ColVarLeaf(col) => col.append_list(),
            _ => {
                return Err(StorageError::BulkLoad(format!(
                    "{} is not a column store",
                    self.tree.name()
                )))
            }
        };
        let value = self.tree.normalize(value)?;

        let recno = self.count + 1;
        let node = InsertNode::new(
            InsertKey::Recno(recno),
            choose_depth(),
            Update::new(Some(self.session.alloc(&value)), None),
        );
        self.append_node(head, node)?;
        self.count = recno;
        self.tree.set_last_recno(recno);
        Ok(recno)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Write the loaded leaf level and re-enable eviction.
    pub fn finish(mut self) -> StorageResult<()> {
        let handle = self
            .leaf
            .take()
            .ok_or_else(|| StorageError::BulkLoad("load already finished".to_string()))?;
        let page = Arc::clone(handle.page());
        drop(handle);

        let options = RecOptions {
            max_entries: self.records_per_page,
            promote_to_root: true,
        };
        let result = self
            .session
            .cache()
            .evict_with(&self.tree, &page, options);
        page.set_bulk(false);
        self.tree.set_no_eviction(false);
        result?;
        info!(
            "{}: bulk load finished, {} entries",
            self.tree.name(),
            self.count
        );
        Ok(())
    }
}

impl Drop for BulkLoad<'_> {
    fn drop(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            leaf.set_bulk(false);
            self.tree.set_no_eviction(false);
        }
    }
}
