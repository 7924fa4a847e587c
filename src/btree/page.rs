//! In-memory pages.

use crate::btree::insert::InsertHead;
use crate::btree::key::RowKey;
use crate::btree::link::Link;
use crate::btree::modify::PageModify;
use crate::btree::reference::{PageRef, RefState};
use crate::btree::update::{Update, UpdateList};
use crate::storage::page::cell::Cell;
use crate::storage::page::{fix, PageType};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Process-unique page identity, used by hazard references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PageId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

const PAGE_PINNED: u8 = 0x01;
const PAGE_BULK: u8 = 0x02;
const PAGE_DISCARDED: u8 = 0x04;

#[derive(Debug)]
pub struct RowChild {
    pub key: RowKey,
    pub pref: Arc<PageRef>,
}

#[derive(Debug)]
pub struct RowInternal {
    pub children: Vec<RowChild>,
}

#[derive(Debug)]
pub struct ColChild {
    pub recno: u64,
    pub pref: Arc<PageRef>,
}

#[derive(Debug)]
pub struct ColInternal {
    pub recno: u64,
    pub children: Vec<ColChild>,
}

#[derive(Debug)]
pub struct RowSlot {
    pub key: RowKey,
    /// `None` when the key has no value cell.
    pub value: Option<Cell>,
}

/// Row leaf: on-page rows plus update chains and insert lists.
///
/// Insert list `i` holds keys sorting after row `i`; the extra list at index
/// `rows.len()` holds keys smaller than every on-page row.
#[derive(Debug)]
pub struct RowLeaf {
    pub rows: Vec<RowSlot>,
    upd: OnceLock<Box<[UpdateList]>>,
    ins: OnceLock<Box<[OnceLock<InsertHead>]>>,
}

impl RowLeaf {
    pub fn new(rows: Vec<RowSlot>) -> Self {
        Self {
            rows,
            upd: OnceLock::new(),
            ins: OnceLock::new(),
        }
    }

    pub fn smallest_list(&self) -> usize {
        self.rows.len()
    }

    pub fn update_head(&self, slot: usize) -> Option<Arc<Update>> {
        self.upd.get().and_then(|upd| upd[slot].load())
    }

    pub(crate) fn update_list(&self, slot: usize) -> &UpdateList {
        &self.upd.get_or_init(|| {
            (0..self.rows.len())
                .map(|_| Link::default())
                .collect()
        })[slot]
    }

    pub fn insert_head(&self, list: usize) -> Option<&InsertHead> {
        self.ins.get().and_then(|ins| ins[list].get())
    }

    pub(crate) fn insert_list(&self, list: usize) -> &InsertHead {
        self.ins.get_or_init(|| {
            (0..=self.rows.len())
                .map(|_| OnceLock::new())
                .collect()
        })[list]
            .get_or_init(InsertHead::new)
    }
}

/// Fixed-length column leaf: a bitfield of `entries` values.
#[derive(Debug)]
pub struct ColFixLeaf {
    pub recno: u64,
    pub entries: u64,
    pub bitcnt: u8,
    pub bits: Bytes,
    update: OnceLock<InsertHead>,
    append: OnceLock<InsertHead>,
}

impl ColFixLeaf {
    pub fn new(recno: u64, entries: u64, bitcnt: u8, bits: Bytes) -> Self {
        Self {
            recno,
            entries,
            bitcnt,
            bits,
            update: OnceLock::new(),
            append: OnceLock::new(),
        }
    }

    pub fn value(&self, index: u64) -> u8 {
        fix::get(&self.bits, index, self.bitcnt)
    }

    /// Last on-page record number, `recno - 1` if the page is empty.
    pub fn last_recno(&self) -> u64 {
        self.recno + self.entries - 1
    }

    pub fn updates(&self) -> Option<&InsertHead> {
        self.update.get()
    }

    pub(crate) fn update_list(&self) -> &InsertHead {
        self.update.get_or_init(InsertHead::new)
    }

    pub fn appends(&self) -> Option<&InsertHead> {
        self.append.get()
    }

    pub(crate) fn append_list(&self) -> &InsertHead {
        self.append.get_or_init(InsertHead::new)
    }
}

/// One repeat group of a variable-length column leaf.
#[derive(Debug)]
pub struct ColVarSlot {
    pub recno: u64,
    pub cell: Cell,
}

impl ColVarSlot {
    pub fn rle(&self) -> u64 {
        self.cell.rle
    }

    pub fn contains(&self, recno: u64) -> bool {
        recno >= self.recno && recno < self.recno + self.cell.rle
    }
}

#[derive(Debug)]
pub struct ColVarLeaf {
    pub recno: u64,
    pub slots: Vec<ColVarSlot>,
    update: OnceLock<Box<[OnceLock<InsertHead>]>>,
    append: OnceLock<InsertHead>,
}

impl ColVarLeaf {
    pub fn new(recno: u64, slots: Vec<ColVarSlot>) -> Self {
        Self {
            recno,
            slots,
            update: OnceLock::new(),
            append: OnceLock::new(),
        }
    }

    pub fn last_recno(&self) -> u64 {
        match self.slots.last() {
            Some(slot) => slot.recno + slot.rle() - 1,
            None => self.recno - 1,
        }
    }

    /// The repeat group holding `recno`.
    pub fn slot_for(&self, recno: u64) -> Option<usize> {
        let pos = self.slots.partition_point(|s| s.recno <= recno);
        let slot = pos.checked_sub(1)?;
        self.slots[slot].contains(recno).then_some(slot)
    }

    pub fn updates(&self, slot: usize) -> Option<&InsertHead> {
        self.update.get().and_then(|u| u[slot].get())
    }

    pub(crate) fn update_list(&self, slot: usize) -> &InsertHead {
        self.update.get_or_init(|| {
            (0..self.slots.len())
                .map(|_| OnceLock::new())
                .collect()
        })[slot]
            .get_or_init(InsertHead::new)
    }

    pub fn appends(&self) -> Option<&InsertHead> {
        self.append.get()
    }

    pub(crate) fn append_list(&self) -> &InsertHead {
        self.append.get_or_init(InsertHead::new)
    }
}

#[derive(Debug)]
pub enum PageKind {
    RowInternal(RowInternal),
    RowLeaf(RowLeaf),
    ColInternal(ColInternal),
    ColFixLeaf(ColFixLeaf),
    ColVarLeaf(ColVarLeaf),
}

impl PageKind {
    pub fn page_type(&self) -> PageType {
        match self {
            PageKind::RowInternal(_) => PageType::RowInt,
            PageKind::RowLeaf(_) => PageType::RowLeaf,
            PageKind::ColInternal(_) => PageType::ColInt,
            PageKind::ColFixLeaf(_) => PageType::ColFix,
            PageKind::ColVarLeaf(_) => PageType::ColVar,
        }
    }

    fn memsize(&self) -> usize {
        match self {
            PageKind::RowInternal(intl) => intl
                .children
                .iter()
                .map(|c| c.key.memsize() + std::mem::size_of::<PageRef>())
                .sum(),
            PageKind::RowLeaf(leaf) => leaf
                .rows
                .iter()
                .map(|r| r.key.memsize() + std::mem::size_of::<RowSlot>())
                .sum(),
            PageKind::ColInternal(intl) => {
                intl.children.len() * (std::mem::size_of::<ColChild>() + std::mem::size_of::<PageRef>())
            }
            PageKind::ColFixLeaf(_) => 0,
            PageKind::ColVarLeaf(leaf) => leaf.slots.len() * std::mem::size_of::<ColVarSlot>(),
        }
    }
}

#[derive(Debug)]
pub struct Page {
    id: PageId,
    kind: PageKind,
    parent: Weak<Page>,
    parent_ref: Weak<PageRef>,
    image: Option<Bytes>,
    read_gen: AtomicU64,
    modify: OnceLock<PageModify>,
    flags: AtomicU8,
    footprint: AtomicUsize,
}

impl Page {
    pub fn new(
        kind: PageKind,
        parent: Weak<Page>,
        parent_ref: Weak<PageRef>,
        image: Option<Bytes>,
        read_gen: u64,
    ) -> Self {
        let footprint = std::mem::size_of::<Page>()
            + image.as_ref().map_or(0, |i| i.len())
            + kind.memsize();
        Self {
            id: PageId::next(),
            kind,
            parent,
            parent_ref,
            image,
            read_gen: AtomicU64::new(read_gen),
            modify: OnceLock::new(),
            flags: AtomicU8::new(0),
            footprint: AtomicUsize::new(footprint),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn page_type(&self) -> PageType {
        self.kind.page_type()
    }

    pub fn is_leaf(&self) -> bool {
        self.page_type().is_leaf()
    }

    pub fn image(&self) -> Option<&Bytes> {
        self.image.as_ref()
    }

    pub fn parent(&self) -> Option<Arc<Page>> {
        self.parent.upgrade()
    }

    pub(crate) fn parent_weak(&self) -> &Weak<Page> {
        &self.parent
    }

    pub fn parent_ref(&self) -> Option<Arc<PageRef>> {
        self.parent_ref.upgrade()
    }

    pub(crate) fn parent_ref_weak(&self) -> &Weak<PageRef> {
        &self.parent_ref
    }

    pub fn read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::Relaxed)
    }

    pub(crate) fn set_read_gen(&self, read_gen: u64) {
        self.read_gen.store(read_gen, Ordering::Relaxed);
    }

    /// The modify block, created on first use.
    pub fn modify(&self) -> &PageModify {
        self.modify.get_or_init(PageModify::new)
    }

    pub fn modify_opt(&self) -> Option<&PageModify> {
        self.modify.get()
    }

    pub fn write_gen(&self) -> u32 {
        self.modify.get().map_or(0, |m| m.write_gen())
    }

    pub fn is_dirty(&self) -> bool {
        self.modify.get().is_some_and(|m| m.is_dirty())
    }

    pub fn footprint(&self) -> usize {
        self.footprint.load(Ordering::Relaxed)
    }

    pub(crate) fn add_footprint(&self, bytes: usize) {
        self.footprint.fetch_add(bytes, Ordering::Relaxed);
    }

    fn flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn set_flag(&self, flag: u8, on: bool) {
        if on {
            self.flags.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.flag(PAGE_PINNED)
    }

    pub(crate) fn set_pinned(&self, on: bool) {
        self.set_flag(PAGE_PINNED, on);
    }

    pub fn is_bulk(&self) -> bool {
        self.flag(PAGE_BULK)
    }

    pub(crate) fn set_bulk(&self, on: bool) {
        self.set_flag(PAGE_BULK, on);
    }

    /// Set once the page has been evicted and must not be used again.
    pub fn is_discarded(&self) -> bool {
        self.flag(PAGE_DISCARDED)
    }

    pub(crate) fn set_discarded(&self) {
        self.set_flag(PAGE_DISCARDED, true);
    }

    pub fn row_leaf(&self) -> Option<&RowLeaf> {
        match &self.kind {
            PageKind::RowLeaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn col_fix(&self) -> Option<&ColFixLeaf> {
        match &self.kind {
            PageKind::ColFixLeaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn col_var(&self) -> Option<&ColVarLeaf> {
        match &self.kind {
            PageKind::ColVarLeaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// References to child pages, empty for leaves.
    pub fn child_refs(&self) -> Vec<&Arc<PageRef>> {
        match &self.kind {
            PageKind::RowInternal(intl) => intl.children.iter().map(|c| &c.pref).collect(),
            PageKind::ColInternal(intl) => intl.children.iter().map(|c| &c.pref).collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_resident_children(&self) -> bool {
        self.child_refs()
            .iter()
            .any(|c| c.state() != RefState::Disk)
    }

    /// True if the page has changes or has never been written.
    pub fn needs_write(&self) -> bool {
        self.is_dirty()
            || self
                .parent_ref
                .upgrade()
                .is_some_and(|r| !r.addr().is_valid())
    }
}
