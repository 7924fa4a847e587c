pub mod bulk;
pub mod col;
pub(crate) mod inmem;
pub mod insert;
pub mod key;
pub mod link;
pub mod modify;
pub(crate) mod ovfl;
pub mod page;
pub mod reconcile;
pub mod reference;
pub mod row;
pub mod search;
pub mod update;
pub mod walk;

pub use bulk::BulkLoad;
pub use page::{Page, PageId, PageKind};
pub use reconcile::{RecOptions, RecOutcome};
pub use reference::{PageRef, RefState};
pub use search::{ColPos, ColSearch, RowPos, RowSearch};

use crate::cache::Cache;
use crate::codec::Codecs;
use crate::config::{TreeConfig, TreeType};
use crate::storage::disk::{BlockAddr, BlockStore, TreeMeta};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cell::{Cell, CellPayload};
use bytes::Bytes;
use key::RowKey;
use log::{debug, info, warn};
use page::{ColChild, ColFixLeaf, ColInternal, ColVarLeaf, RowChild, RowInternal, RowLeaf};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(pub u32);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree-{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    /// Ignored when the store already holds a tree.
    pub config: TreeConfig,
    pub codecs: Codecs,
}

#[derive(Debug, Default)]
pub struct TreeStats {
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub overflow_reads: AtomicU64,
    pub overflow_writes: AtomicU64,
    pub splits: AtomicU64,
}

pub struct BTree {
    id: TreeId,
    name: String,
    store: Arc<dyn BlockStore>,
    config: TreeConfig,
    codecs: Codecs,
    pub(crate) root: Arc<PageRef>,
    lsn: AtomicU64,
    last_recno: AtomicU64,
    no_eviction: AtomicBool,
    pub(crate) evict_walk_last: Mutex<Option<PageId>>,
    pub(crate) stats: TreeStats,
}

impl BTree {
    /// Open the tree held by `store`, or create an empty one.
    pub(crate) fn open(
        cache: &Cache,
        id: TreeId,
        name: &str,
        store: Arc<dyn BlockStore>,
        options: TreeOptions,
    ) -> StorageResult<Arc<Self>> {
        let meta = store.load_meta()?;
        let (config, root_addr, lsn) = match meta {
            Some(meta) => {
                if meta.config.tree_type != options.config.tree_type {
                    warn!(
                        "{}: stored tree type {:?} overrides requested {:?}",
                        name, meta.config.tree_type, options.config.tree_type
                    );
                }
                (meta.config, meta.root, meta.lsn)
            }
            None => (options.config, BlockAddr::INVALID, 0),
        };
        config.validate()?;
        if config.allocation_size != store.allocation_size() {
            return Err(StorageError::InvalidConfig(format!(
                "tree allocation size {} does not match the block store's {}",
                config.allocation_size,
                store.allocation_size()
            )));
        }

        let tree = Arc::new(Self {
            id,
            name: name.to_string(),
            store,
            config,
            codecs: options.codecs,
            root: PageRef::on_disk(root_addr),
            lsn: AtomicU64::new(lsn),
            last_recno: AtomicU64::new(0),
            no_eviction: AtomicBool::new(false),
            evict_walk_last: Mutex::new(None),
            stats: TreeStats::default(),
        });

        if root_addr.is_valid() {
            cache.read_now(&tree, &tree.root, Weak::new())?;
            if let Some(root) = tree.root.page() {
                if root.is_leaf() {
                    return Err(StorageError::corruption(format!(
                        "{name}: root block {root_addr} is a leaf page"
                    )));
                }
                root.set_pinned(true);
            }
            if tree.config.tree_type.is_column() {
                let last = tree.find_last_recno(cache)?;
                tree.last_recno.store(last, Ordering::Release);
            }
            info!("{}: opened with root {}", tree.name, root_addr);
        } else {
            tree.init_empty(cache);
            info!("{}: created empty {:?} tree", tree.name, tree.config.tree_type);
        }
        Ok(tree)
    }

    /// Build an unwritten root internal page with one empty leaf.
    fn init_empty(&self, cache: &Cache) {
        let leaf_ref = PageRef::unwritten();
        let root_kind = match self.config.tree_type {
            TreeType::Row => PageKind::RowInternal(RowInternal {
                children: vec![RowChild {
                    key: RowKey::from_bytes(Bytes::new()),
                    pref: leaf_ref.clone(),
                }],
            }),
            TreeType::ColumnFixed { .. } | TreeType::ColumnVariable => {
                PageKind::ColInternal(ColInternal {
                    recno: 1,
                    children: vec![ColChild {
                        recno: 1,
                        pref: leaf_ref.clone(),
                    }],
                })
            }
        };
        let root = Arc::new(Page::new(
            root_kind,
            Weak::new(),
            Arc::downgrade(&self.root),
            None,
            cache.next_read_gen(),
        ));
        root.set_pinned(true);

        let leaf_kind = match self.config.tree_type {
            TreeType::Row => PageKind::RowLeaf(RowLeaf::new(Vec::new())),
            TreeType::ColumnFixed { bitcnt } => {
                PageKind::ColFixLeaf(ColFixLeaf::new(1, 0, bitcnt, Bytes::new()))
            }
            TreeType::ColumnVariable => PageKind::ColVarLeaf(ColVarLeaf::new(1, Vec::new())),
        };
        let leaf = Arc::new(Page::new(
            leaf_kind,
            Arc::downgrade(&root),
            Arc::downgrade(&leaf_ref),
            None,
            cache.next_read_gen(),
        ));

        cache.account_in(leaf.footprint());
        leaf_ref.install(leaf);
        cache.account_in(root.footprint());
        self.root.install(root);
    }

    /// Follow the rightmost path to the last record number in the tree.
    fn find_last_recno(self: &Arc<Self>, cache: &Cache) -> StorageResult<u64> {
        let mut page = self
            .root
            .page()
            .ok_or_else(|| StorageError::corruption("root page is not resident"))?;
        loop {
            let child = match page.kind() {
                PageKind::ColInternal(intl) => match intl.children.last() {
                    Some(child) => child.pref.clone(),
                    None => return Err(StorageError::corruption("internal page has no children")),
                },
                PageKind::ColFixLeaf(leaf) => return Ok(leaf.last_recno()),
                PageKind::ColVarLeaf(leaf) => return Ok(leaf.last_recno()),
                other => {
                    return Err(StorageError::corruption(format!(
                        "{} page in a column store",
                        other.page_type()
                    )))
                }
            };
            if child.page().is_none() {
                cache.read_now(self, &child, Arc::downgrade(&page))?;
            }
            page = child
                .page()
                .ok_or_else(|| StorageError::corruption("child page failed to load"))?;
        }
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn codecs(&self) -> &Codecs {
        &self.codecs
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn root(&self) -> &Arc<PageRef> {
        &self.root
    }

    pub fn lsn(&self) -> u64 {
        self.lsn.load(Ordering::Acquire)
    }

    /// Highest record number allocated in a column store.
    pub fn last_recno(&self) -> u64 {
        self.last_recno.load(Ordering::Acquire)
    }

    pub(crate) fn allocate_recno(&self) -> u64 {
        self.last_recno.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_last_recno(&self, recno: u64) {
        self.last_recno.fetch_max(recno, Ordering::AcqRel);
    }

    pub fn is_no_eviction(&self) -> bool {
        self.no_eviction.load(Ordering::Acquire)
    }

    pub(crate) fn set_no_eviction(&self, on: bool) {
        self.no_eviction.store(on, Ordering::Release);
    }

    /// Build a row key from its on-page cell.
    pub(crate) fn instantiate_key(&self, payload: &CellPayload) -> StorageResult<Bytes> {
        match payload {
            CellPayload::Key(data) => self.codecs.decode_key(data),
            CellPayload::KeyOverflow(addr) => {
                let data = ovfl::read(self, *addr)?;
                self.codecs.decode_key(&data)
            }
            other => Err(StorageError::corruption(format!(
                "expected a key cell, found {other:?}"
            ))),
        }
    }

    /// The value an on-page cell stores; `None` for a deleted record.
    pub(crate) fn cell_value(&self, cell: Option<&Cell>) -> StorageResult<Option<Bytes>> {
        let Some(cell) = cell else {
            return Ok(Some(Bytes::new()));
        };
        match &cell.payload {
            CellPayload::Value(data) => self.codecs.decode_value(data).map(Some),
            CellPayload::ValueOverflow(addr) => {
                let data = ovfl::read(self, *addr)?;
                self.codecs.decode_value(&data).map(Some)
            }
            CellPayload::Deleted => Ok(None),
            other => Err(StorageError::corruption(format!(
                "expected a value cell, found {other:?}"
            ))),
        }
    }

    /// Record the current root in the store's description record.
    pub(crate) fn write_meta(&self) -> StorageResult<()> {
        let lsn = self.lsn.fetch_add(1, Ordering::AcqRel) + 1;
        let meta = TreeMeta {
            root: self.root.addr(),
            lsn,
            config: self.config.clone(),
        };
        self.store.store_meta(&meta)?;
        self.store.sync()?;
        debug!("{}: metadata written, root {} lsn {}", self.name, meta.root, lsn);
        Ok(())
    }
}

impl fmt::Debug for BTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTree")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tree_type", &self.config.tree_type)
            .field("root", &self.root)
            .finish()
    }
}
