use crate::btree::page::Page;
use crate::btree::reference::{PageRef, RefState};
use crate::btree::BTree;
use std::sync::Arc;

/// Resident pages of a tree in post-order: every child before its parent,
/// siblings in key order, the root last.
///
/// Only eviction calls this, serialized by the cache's eviction lock, so the
/// shape of the tree does not change under the walk.
pub fn resident_pages(tree: &BTree) -> Vec<Arc<Page>> {
    let mut pages = Vec::new();
    visit(tree.root(), &mut pages);
    pages
}

fn visit(pref: &Arc<PageRef>, pages: &mut Vec<Arc<Page>>) {
    if !matches!(pref.state(), RefState::Mem | RefState::Locked) {
        return;
    }
    let Some(page) = pref.page() else {
        return;
    };
    for child in page.child_refs() {
        visit(child, pages);
    }
    pages.push(page);
}
