//! Descend from the root to the leaf holding a key or record number.
//!
//! A search ends holding a hazard reference on the leaf and the leaf's write
//! generation as it was before any of its lists were read. Handing the
//! result to an apply function either modifies the page as the search saw
//! it or fails with a write conflict.

use crate::btree::insert::{InsertKey, InsertSearch};
use crate::btree::page::{Page, PageKind, RowInternal};
use crate::btree::reference::PageRef;
use crate::btree::BTree;
use crate::cache::PageHandle;
use crate::session::Session;
use crate::storage::error::{StorageError, StorageResult};
use bytes::Bytes;
use std::cmp::Ordering;
use std::sync::{Arc, Weak};

#[derive(Debug)]
pub enum RowPos {
    /// The key is on the page at this row.
    OnPage { slot: usize },
    /// The key belongs in insert list `list`.
    Insert { list: usize, ins: InsertSearch },
}

#[derive(Debug)]
pub struct RowSearch {
    pub page: PageHandle,
    pub write_gen: u32,
    pub pos: RowPos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColPos {
    /// On-page record of a fixed-length leaf.
    Fix { index: u64 },
    /// Repeat group of a variable-length leaf.
    Var { slot: usize },
    /// Past the last on-page record of the rightmost leaf.
    Append,
    /// Not covered by the leaf.
    Missing,
}

#[derive(Debug)]
pub struct ColSearch {
    pub page: PageHandle,
    pub write_gen: u32,
    pub recno: u64,
    pub pos: ColPos,
    /// Search of the list that overrides `pos`.
    pub ins: InsertSearch,
}

fn unexpected(page: &Page, tree: &BTree) -> StorageError {
    StorageError::corruption(format!(
        "{}: {} page in a {:?} tree",
        tree.name(),
        page.page_type(),
        tree.config().tree_type
    ))
}

impl BTree {
    /// Walk down from the root. `choose` names the child to follow, or
    /// `None` once a leaf is reached.
    fn descend<F>(self: &Arc<Self>, session: &Session, mut choose: F) -> StorageResult<PageHandle>
    where
        F: FnMut(&Page) -> StorageResult<Option<Arc<PageRef>>>,
    {
        let mut current = session.page_in(self, &self.root, &Weak::new())?;
        while let Some(child) = choose(&current)? {
            // The child's hazard is held before the parent's is released.
            let next = session.page_in(self, &child, &Arc::downgrade(current.page()))?;
            current = next;
        }
        Ok(current)
    }

    /// Index of the child covering `key`; the first child covers everything
    /// below the second child's key.
    fn row_child(&self, intl: &RowInternal, key: &[u8]) -> StorageResult<usize> {
        let (mut lo, mut hi) = (1, intl.children.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if intl.children[mid].key.get(self)?.as_ref() <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo - 1)
    }

    pub fn row_search(self: &Arc<Self>, session: &Session, key: &[u8]) -> StorageResult<RowSearch> {
        if self.config().tree_type.is_column() {
            return Err(StorageError::InvalidConfig(format!(
                "{}: row search in a column store",
                self.name()
            )));
        }

        let page = self.descend(session, |page| match page.kind() {
            PageKind::RowInternal(intl) => {
                let child = self.row_child(intl, key)?;
                Ok(Some(intl.children[child].pref.clone()))
            }
            PageKind::RowLeaf(_) => Ok(None),
            _ => Err(unexpected(page, self)),
        })?;

        let write_gen = page.write_gen();
        let leaf = page.row_leaf().ok_or_else(|| unexpected(&page, self))?;

        let (mut lo, mut hi) = (0, leaf.rows.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match leaf.rows[mid].key.get(self)?.as_ref().cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => {
                    return Ok(RowSearch {
                        page,
                        write_gen,
                        pos: RowPos::OnPage { slot: mid },
                    })
                }
            }
        }

        let list = match lo {
            0 => leaf.smallest_list(),
            n => n - 1,
        };
        let ins = leaf
            .insert_head(list)
            .map(|head| head.search(&InsertKey::Row(Bytes::copy_from_slice(key))))
            .unwrap_or_default();
        Ok(RowSearch {
            page,
            write_gen,
            pos: RowPos::Insert { list, ins },
        })
    }

    pub fn col_search(self: &Arc<Self>, session: &Session, recno: u64) -> StorageResult<ColSearch> {
        if !self.config().tree_type.is_column() {
            return Err(StorageError::InvalidConfig(format!(
                "{}: record number search in a row store",
                self.name()
            )));
        }

        let mut rightmost = true;
        let page = self.descend(session, |page| match page.kind() {
            PageKind::ColInternal(intl) => {
                let child = intl
                    .children
                    .partition_point(|c| c.recno <= recno)
                    .saturating_sub(1);
                rightmost &= child + 1 == intl.children.len();
                Ok(Some(intl.children[child].pref.clone()))
            }
            PageKind::ColFixLeaf(_) | PageKind::ColVarLeaf(_) => Ok(None),
            _ => Err(unexpected(page, self)),
        })?;

        let write_gen = page.write_gen();
        let key = InsertKey::Recno(recno);
        let (pos, list) = match page.kind() {
            PageKind::ColFixLeaf(leaf) => {
                if recno >= leaf.recno && recno <= leaf.last_recno() {
                    (
                        ColPos::Fix {
                            index: recno - leaf.recno,
                        },
                        leaf.updates(),
                    )
                } else if rightmost && recno > leaf.last_recno() {
                    (ColPos::Append, leaf.appends())
                } else {
                    (ColPos::Missing, None)
                }
            }
            PageKind::ColVarLeaf(leaf) => match leaf.slot_for(recno) {
                Some(slot) => (ColPos::Var { slot }, leaf.updates(slot)),
                None if rightmost && recno > leaf.last_recno() => (ColPos::Append, leaf.appends()),
                None => (ColPos::Missing, None),
            },
            _ => return Err(unexpected(&page, self)),
        };
        let ins = list.map(|head| head.search(&key)).unwrap_or_default();

        Ok(ColSearch {
            page,
            write_gen,
            recno,
            pos,
            ins,
        })
    }
}
