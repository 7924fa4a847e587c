#![allow(dead_code)]

use std::sync::Arc;
use vibetree::btree::page::PageKind;
use vibetree::btree::{BTree, Page, PageRef};
use vibetree::storage::MemoryBlockStore;
use vibetree::{Connection, ConnectionConfig, Session, TreeConfig, TreeOptions};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn connection() -> anyhow::Result<Connection> {
    init_logging();
    Ok(Connection::open(ConnectionConfig::default())?)
}

pub fn memory_tree(
    conn: &Connection,
    config: TreeConfig,
) -> anyhow::Result<(Arc<MemoryBlockStore>, Arc<BTree>)> {
    let store = Arc::new(MemoryBlockStore::new(config.allocation_size));
    let tree = conn.open_tree(
        "test",
        store.clone(),
        TreeOptions {
            config,
            ..TreeOptions::default()
        },
    )?;
    Ok((store, tree))
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}

pub fn value(i: usize) -> Vec<u8> {
    format!("value-{i}").into_bytes()
}

pub fn root_page(tree: &BTree) -> anyhow::Result<Arc<Page>> {
    tree.root()
        .page()
        .ok_or_else(|| anyhow::anyhow!("root page is not resident"))
}

/// The reference of the root's first child.
pub fn first_child(tree: &BTree) -> anyhow::Result<Arc<PageRef>> {
    let root = root_page(tree)?;
    let child = root
        .child_refs()
        .first()
        .map(|&c| Arc::clone(c))
        .ok_or_else(|| anyhow::anyhow!("root has no children"))?;
    Ok(child)
}

/// Summary of a leaf found by [`leaves`].
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub first_key: Option<Vec<u8>>,
    pub last_key: Option<Vec<u8>>,
    pub recno: u64,
    pub last_recno: u64,
}

/// Every leaf of the tree in order, read in as needed.
pub fn leaves(session: &Session, tree: &Arc<BTree>) -> anyhow::Result<Vec<LeafInfo>> {
    let mut out = Vec::new();
    let root = session.page_in(tree, tree.root(), &std::sync::Weak::new())?;
    visit(session, tree, root.page(), &mut out)?;
    Ok(out)
}

fn visit(
    session: &Session,
    tree: &Arc<BTree>,
    page: &Arc<Page>,
    out: &mut Vec<LeafInfo>,
) -> anyhow::Result<()> {
    match page.kind() {
        PageKind::RowLeaf(leaf) => {
            let first = leaf.rows.first().map(|r| r.key.get(tree)).transpose()?;
            let last = leaf.rows.last().map(|r| r.key.get(tree)).transpose()?;
            out.push(LeafInfo {
                first_key: first.map(|k| k.to_vec()),
                last_key: last.map(|k| k.to_vec()),
                recno: 0,
                last_recno: 0,
            });
        }
        PageKind::ColFixLeaf(leaf) => out.push(LeafInfo {
            first_key: None,
            last_key: None,
            recno: leaf.recno,
            last_recno: leaf.last_recno(),
        }),
        PageKind::ColVarLeaf(leaf) => out.push(LeafInfo {
            first_key: None,
            last_key: None,
            recno: leaf.recno,
            last_recno: leaf.last_recno(),
        }),
        PageKind::RowInternal(_) | PageKind::ColInternal(_) => {
            for child in page.child_refs() {
                let handle = session.page_in(tree, child, &Arc::downgrade(page))?;
                visit(session, tree, handle.page(), out)?;
            }
        }
    }
    Ok(())
}
