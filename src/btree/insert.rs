//! Skip lists of keys and records inserted between on-page entries.
//!
//! Nodes are immutable once published except for their forward links and
//! update chain. Insertion fills the new node's links from the search stack,
//! publishes it, and only then repoints the stack's links at it, so a reader
//! walking the list concurrently sees either the old list or the new one.

use crate::btree::link::Link;
use crate::btree::update::{Update, UpdateList};
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;

pub const SKIP_MAXDEPTH: usize = 10;

/// One in four nodes reach the next level.
const SKIP_PROBABILITY: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum InsertKey {
    Row(Bytes),
    Recno(u64),
}

impl InsertKey {
    pub fn row(&self) -> Option<&Bytes> {
        match self {
            InsertKey::Row(key) => Some(key),
            InsertKey::Recno(_) => None,
        }
    }

    pub fn recno(&self) -> Option<u64> {
        match self {
            InsertKey::Recno(recno) => Some(*recno),
            InsertKey::Row(_) => None,
        }
    }

    fn memsize(&self) -> usize {
        match self {
            InsertKey::Row(key) => key.len(),
            InsertKey::Recno(_) => 0,
        }
    }
}

#[derive(Debug)]
pub struct InsertNode {
    key: InsertKey,
    pub(crate) upd: UpdateList,
    next: Box<[Link<InsertNode>]>,
}

impl InsertNode {
    pub fn new(key: InsertKey, depth: usize, first: Update) -> Self {
        Self {
            key,
            upd: Link::new(Some(Arc::new(first))),
            next: (0..depth.clamp(1, SKIP_MAXDEPTH))
                .map(|_| Link::default())
                .collect(),
        }
    }

    pub fn key(&self) -> &InsertKey {
        &self.key
    }

    pub fn depth(&self) -> usize {
        self.next.len()
    }

    pub fn next(&self) -> Option<Arc<InsertNode>> {
        self.next[0].load()
    }

    /// The newest update for this key.
    pub fn update(&self) -> Option<Arc<Update>> {
        self.upd.load()
    }

    pub fn memsize(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.key.memsize()
            + self.next.len() * std::mem::size_of::<Link<InsertNode>>()
    }
}

/// Choose a node depth: geometric with probability 1/4 per level.
pub fn choose_depth() -> usize {
    let mut rng = rand::thread_rng();
    let mut depth = 1;
    while depth < SKIP_MAXDEPTH && rng.gen_ratio(1, SKIP_PROBABILITY) {
        depth += 1;
    }
    depth
}

/// For each level, the node whose link a new node is spliced after; `None`
/// is the list head.
#[derive(Debug, Default, Clone)]
pub struct InsertStack {
    prev: [Option<Arc<InsertNode>>; SKIP_MAXDEPTH],
}

#[derive(Debug, Default)]
pub struct InsertSearch {
    pub exact: Option<Arc<InsertNode>>,
    pub stack: InsertStack,
}

#[derive(Debug, Default)]
pub struct InsertHead {
    head: [Link<InsertNode>; SKIP_MAXDEPTH],
    tail: [Link<InsertNode>; SKIP_MAXDEPTH],
}

impl InsertHead {
    pub fn new() -> Self {
        Self::default()
    }

    fn link<'a>(&'a self, prev: &'a Option<Arc<InsertNode>>, level: usize) -> &'a Link<InsertNode> {
        match prev {
            None => &self.head[level],
            Some(node) => &node.next[level],
        }
    }

    pub fn first(&self) -> Option<Arc<InsertNode>> {
        self.head[0].load()
    }

    pub fn last(&self) -> Option<Arc<InsertNode>> {
        self.tail[0].load()
    }

    pub fn is_empty(&self) -> bool {
        self.head[0].is_empty()
    }

    pub fn iter(&self) -> InsertIter {
        InsertIter { next: self.first() }
    }

    pub fn search(&self, key: &InsertKey) -> InsertSearch {
        let mut stack = InsertStack::default();
        let mut prev: Option<Arc<InsertNode>> = None;

        for level in (0..SKIP_MAXDEPTH).rev() {
            loop {
                let next = self.link(&prev, level).load();
                match next {
                    Some(node) if node.key < *key => prev = Some(node),
                    Some(node) if node.key == *key => {
                        return InsertSearch {
                            exact: Some(node),
                            stack,
                        }
                    }
                    _ => break,
                }
            }
            stack.prev[level] = prev.clone();
        }

        InsertSearch { exact: None, stack }
    }

    /// The stack that appends after the current last node.
    pub fn append_stack(&self) -> InsertStack {
        let mut stack = InsertStack::default();
        for level in 0..SKIP_MAXDEPTH {
            stack.prev[level] = self.tail[level].load();
        }
        stack
    }

    /// Link a fully built node into the list.
    ///
    /// Callers hold the page's write serialization and have checked that the
    /// stack is still current.
    pub(crate) fn splice(&self, node: Arc<InsertNode>, stack: &InsertStack) {
        let depth = node.depth();
        for level in 0..depth {
            node.next[level].publish(self.link(&stack.prev[level], level).load());
        }
        for level in 0..depth {
            self.link(&stack.prev[level], level)
                .publish(Some(node.clone()));
            if node.next[level].is_empty() {
                self.tail[level].publish(Some(node.clone()));
            }
        }
    }
}

pub struct InsertIter {
    next: Option<Arc<InsertNode>>,
}

impl Iterator for InsertIter {
    type Item = Arc<InsertNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next.take()?;
        self.next = node.next();
        Some(node)
    }
}
