//! Reconciliation: write an in-memory page, with its updates and inserts
//! merged in, back to disk.
//!
//! The page's content is laid out as a sequence of units (a row, a child
//! reference, a run of column records) encoded into one working buffer. If
//! everything fits on one page the result replaces the page's block; larger
//! content is cut into split-sized chunks, each written as its own block,
//! and a new internal page referencing the chunks is built to take the
//! page's place.
//!
//! Nothing reconciliation does is visible until it succeeds: blocks written
//! by a failed attempt are freed again and the page keeps its modify state.

mod col;
mod row;

use crate::btree::key::RowKey;
use crate::btree::modify::TrackedOverflow;
use crate::btree::ovfl;
use crate::btree::page::{ColChild, ColInternal, Page, PageKind, RowChild, RowInternal};
use crate::btree::reference::PageRef;
use crate::btree::BTree;
use crate::config::TreeType;
use crate::storage::disk::BlockAddr;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cell::{self, Cell};
use crate::storage::page::{self, PageHeader, PAGE_HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, Default)]
pub struct RecOptions {
    /// Cap on units per page, used by bulk load.
    pub max_entries: Option<u64>,
    /// Install a split's internal page as the tree root.
    pub promote_to_root: bool,
}

#[derive(Debug)]
pub enum RecOutcome {
    /// The page has no changes and its block is current.
    Clean,
    /// The page was written to this block.
    Written(BlockAddr),
    /// The page was split; this unwritten internal page replaces it.
    Split(Arc<Page>),
}

/// First key or record number of a unit.
enum UnitStart<'a> {
    Key(Bytes),
    RowKey(&'a RowKey),
    Recno(u64),
}

struct Unit<'a> {
    start: UnitStart<'a>,
    offset: usize,
    len: usize,
    entries: u32,
}

enum ChunkStart {
    Key(Bytes),
    Recno(u64),
}

struct Chunk {
    image: Bytes,
    start: ChunkStart,
}

pub(crate) struct Reconciler<'a> {
    tree: &'a BTree,
    page: &'a Page,
    item_max: usize,
    buf: BytesMut,
    units: Vec<Unit<'a>>,
    /// Overflow items the new image references.
    overflow: Vec<TrackedOverflow>,
    /// Blocks this attempt wrote.
    written: Vec<BlockAddr>,
    /// Blocks to free once the attempt succeeds.
    discard: Vec<BlockAddr>,
    /// Overflow blocks of the disk image that are no longer referenced.
    superseded: Vec<BlockAddr>,
}

/// Reconcile `page`, the page `pref` holds.
///
/// The caller has exclusive access to the page: its reference is locked and
/// no hazard references are held.
pub fn reconcile(
    tree: &BTree,
    page: &Page,
    pref: &PageRef,
    options: RecOptions,
) -> StorageResult<RecOutcome> {
    let old = pref.addr();
    if !page.is_dirty() && old.is_valid() {
        return Ok(RecOutcome::Clean);
    }

    // Changes made after this point leave the page dirty.
    let gen = page.write_gen();
    let mut rec = Reconciler::new(tree, page);
    match rec.run(old, options) {
        Ok(outcome) => {
            rec.commit(gen);
            Ok(outcome)
        }
        Err(e) => {
            warn!(
                "{}: reconciliation of {} page {:?} failed: {}",
                tree.name(),
                page.page_type(),
                page.id(),
                e
            );
            rec.abort();
            Err(e)
        }
    }
}

impl<'a> Reconciler<'a> {
    fn new(tree: &'a BTree, page: &'a Page) -> Self {
        let item_max = if page.is_leaf() {
            tree.config().leaf_item_max()
        } else {
            tree.config().internal_item_max()
        };
        Self {
            tree,
            page,
            item_max: item_max as usize,
            buf: BytesMut::new(),
            units: Vec::new(),
            overflow: Vec::new(),
            written: Vec::new(),
            discard: Vec::new(),
            superseded: Vec::new(),
        }
    }

    fn run(&mut self, old: BlockAddr, options: RecOptions) -> StorageResult<RecOutcome> {
        let page = self.page;
        let recno = match page.kind() {
            PageKind::ColFixLeaf(leaf) => {
                let chunks = self.col_fix(leaf, options.max_entries)?;
                return self.place(chunks, old, options);
            }
            PageKind::RowInternal(intl) => {
                self.row_internal(intl)?;
                0
            }
            PageKind::RowLeaf(leaf) => {
                self.row_leaf(leaf)?;
                0
            }
            PageKind::ColInternal(intl) => {
                self.col_internal(intl)?;
                intl.recno
            }
            PageKind::ColVarLeaf(leaf) => {
                self.col_var(leaf)?;
                leaf.recno
            }
        };
        let chunks = self.cell_chunks(recno, options.max_entries)?;
        self.place(chunks, old, options)
    }

    fn page_max(&self) -> (usize, usize) {
        let config = self.tree.config();
        if self.page.is_leaf() {
            (config.leaf_page_max as usize, config.leaf_split_size() as usize)
        } else {
            (
                config.internal_page_max as usize,
                config.internal_split_size() as usize,
            )
        }
    }

    fn begin_unit(&self) -> usize {
        self.buf.len()
    }

    fn end_unit(&mut self, offset: usize, start: UnitStart<'a>, entries: u32) {
        self.units.push(Unit {
            start,
            offset,
            len: self.buf.len() - offset,
            entries,
        });
    }

    /// Write `data` as an overflow item, reusing a block that already holds
    /// it when this page wrote one before.
    fn overflow_item(&mut self, data: Bytes) -> StorageResult<BlockAddr> {
        if let Some(found) = self.overflow.iter().find(|t| t.data == data) {
            return Ok(found.addr);
        }
        let tracked = self.page.modify().track().find_overflow(&data);
        let addr = match tracked {
            Some(addr) => addr,
            None => {
                let addr = ovfl::write(self.tree, &data)?;
                self.written.push(addr);
                addr
            }
        };
        self.overflow.push(TrackedOverflow { data, addr });
        Ok(addr)
    }

    fn key_cell(&mut self, key: &Bytes) -> StorageResult<()> {
        let encoded = self.tree.codecs().encode_key(key)?;
        if encoded.len() > self.item_max {
            let addr = self.overflow_item(encoded)?;
            cell::encode_key_overflow(&mut self.buf, addr);
        } else {
            cell::encode_key(&mut self.buf, &encoded);
        }
        Ok(())
    }

    fn value_cell(&mut self, value: &Bytes, rle: u64) -> StorageResult<()> {
        let encoded = self.tree.codecs().encode_value(value)?;
        if encoded.len() > self.item_max {
            let addr = self.overflow_item(encoded)?;
            cell::encode_value_overflow(&mut self.buf, addr, rle);
        } else {
            cell::encode_value(&mut self.buf, &encoded, rle);
        }
        Ok(())
    }

    fn raw_cell(&mut self, cell: &Cell) {
        self.buf.put_slice(&cell.raw);
    }

    /// An on-page cell is no longer written; release its overflow block.
    fn supersede(&mut self, cell: &Cell) {
        if let Some(addr) = cell.payload.overflow() {
            self.superseded.push(addr);
        }
    }

    fn chunk_ranges(&self, max_entries: Option<u64>) -> Vec<Range<usize>> {
        let (page_max, split_size) = self.page_max();
        let count = self.units.len();
        let fits = PAGE_HEADER_SIZE + self.buf.len() <= page_max
            && max_entries.map_or(true, |max| count as u64 <= max);
        // An internal page with resident children stays whole: its children
        // belong to it until they are evicted.
        if count == 0 || fits || self.page.has_resident_children() {
            return vec![0..count];
        }

        let mut ranges = Vec::new();
        let mut start = 0;
        let mut size = PAGE_HEADER_SIZE;
        for (i, unit) in self.units.iter().enumerate() {
            let full = i > start
                && (size + unit.len > split_size
                    || max_entries.is_some_and(|max| (i - start) as u64 >= max));
            if full {
                ranges.push(start..i);
                start = i;
                size = PAGE_HEADER_SIZE;
            }
            size += unit.len;
        }
        ranges.push(start..count);
        ranges
    }

    fn unit_key(&self, start: &UnitStart<'_>) -> StorageResult<ChunkStart> {
        Ok(match start {
            UnitStart::Key(key) => ChunkStart::Key(key.clone()),
            UnitStart::RowKey(key) => ChunkStart::Key(key.get(self.tree)?),
            UnitStart::Recno(recno) => ChunkStart::Recno(*recno),
        })
    }

    /// Cut the encoded units into page images.
    fn cell_chunks(&self, page_recno: u64, max_entries: Option<u64>) -> StorageResult<Vec<Chunk>> {
        let ranges = self.chunk_ranges(max_entries);
        let split = ranges.len() > 1;
        let mut chunks = Vec::with_capacity(ranges.len());
        for range in ranges {
            let units = &self.units[range];
            let (body, entries, start) = match (units.first(), units.last()) {
                (Some(first), Some(last)) => (
                    &self.buf[first.offset..last.offset + last.len],
                    units.iter().map(|u| u.entries).sum::<u32>(),
                    Some(&first.start),
                ),
                _ => (&self.buf[..0], 0, None),
            };

            let mut header = PageHeader::new(self.page.page_type());
            header.lsn = self.tree.lsn();
            header.entries = entries;
            header.recno = match start {
                Some(UnitStart::Recno(recno)) => *recno,
                _ => page_recno,
            };
            let start = match start {
                Some(start) if split => self.unit_key(start)?,
                _ if self.tree.config().tree_type.is_column() => ChunkStart::Recno(header.recno),
                _ => ChunkStart::Key(Bytes::new()),
            };

            let mut buf = page::new_image(PAGE_HEADER_SIZE + body.len());
            buf.put_slice(body);
            chunks.push(Chunk {
                image: page::finish_image(buf, header, self.tree.config().allocation_size),
                start,
            });
        }
        Ok(chunks)
    }

    fn write_block(&mut self, image: &[u8]) -> StorageResult<BlockAddr> {
        let addr = self.tree.store().write(image)?;
        self.written.push(addr);
        self.tree.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    fn place(
        &mut self,
        chunks: Vec<Chunk>,
        old: BlockAddr,
        options: RecOptions,
    ) -> StorageResult<RecOutcome> {
        if let [chunk] = chunks.as_slice() {
            let addr = if old.is_valid() && old.size as usize == chunk.image.len() {
                self.tree.store().write_at(old, &chunk.image)?;
                self.tree.stats.pages_written.fetch_add(1, Ordering::Relaxed);
                old
            } else {
                let addr = self.write_block(&chunk.image)?;
                if old.is_valid() {
                    self.discard.push(old);
                }
                addr
            };
            debug!(
                "{}: wrote {} page {:?} to {}",
                self.tree.name(),
                self.page.page_type(),
                self.page.id(),
                addr
            );
            return Ok(RecOutcome::Written(addr));
        }

        let mut children = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let addr = self.write_block(&chunk.image)?;
            children.push((chunk.start, PageRef::on_disk(addr)));
        }
        if old.is_valid() {
            self.discard.push(old);
        }

        let kind = match self.tree.config().tree_type {
            TreeType::Row => PageKind::RowInternal(RowInternal {
                children: children
                    .into_iter()
                    .map(|(start, pref)| match start {
                        ChunkStart::Key(key) => Ok(RowChild {
                            key: RowKey::from_bytes(key),
                            pref,
                        }),
                        ChunkStart::Recno(_) => Err(StorageError::corruption(
                            "record number chunk in a row store",
                        )),
                    })
                    .collect::<StorageResult<Vec<_>>>()?,
            }),
            TreeType::ColumnFixed { .. } | TreeType::ColumnVariable => {
                let children = children
                    .into_iter()
                    .map(|(start, pref)| match start {
                        ChunkStart::Recno(recno) => Ok(ColChild { recno, pref }),
                        ChunkStart::Key(_) => {
                            Err(StorageError::corruption("key chunk in a column store"))
                        }
                    })
                    .collect::<StorageResult<Vec<_>>>()?;
                PageKind::ColInternal(ColInternal {
                    recno: children.first().map_or(1, |c| c.recno),
                    children,
                })
            }
        };
        let count = kind_children(&kind);

        let (parent, parent_ref) = if options.promote_to_root {
            (Weak::new(), Arc::downgrade(self.tree.root()))
        } else {
            (
                self.page.parent_weak().clone(),
                self.page.parent_ref_weak().clone(),
            )
        };
        let split = Arc::new(Page::new(
            kind,
            parent,
            parent_ref,
            None,
            self.page.read_gen(),
        ));
        split.modify().mark_dirty();

        self.tree.stats.splits.fetch_add(1, Ordering::Relaxed);
        info!(
            "{}: {} page {:?} split into {} pages",
            self.tree.name(),
            self.page.page_type(),
            self.page.id(),
            count
        );
        Ok(RecOutcome::Split(split))
    }

    /// The new image is in place: release what it no longer references.
    fn commit(self, gen: u32) {
        let (tree, page) = (self.tree, self.page);
        let modify = page.modify();
        let mut frees = self.discard;
        {
            let mut track = modify.track();
            frees.extend(
                track
                    .overflow
                    .iter()
                    .filter(|old| !self.overflow.iter().any(|new| new.addr == old.addr))
                    .map(|old| old.addr),
            );
            for addr in self.superseded {
                let reused = self.overflow.iter().any(|new| new.addr == addr);
                if !reused && track.freed.insert(addr) {
                    frees.push(addr);
                }
            }
            track.overflow = self.overflow;
        }
        for addr in frees {
            if let Err(e) = tree.store().free(addr) {
                warn!("{}: failed to free block {}: {}", tree.name(), addr, e);
            }
        }
        modify.mark_clean(gen);
    }

    fn abort(self) {
        for addr in self.written {
            if let Err(e) = self.tree.store().free(addr) {
                warn!("{}: failed to free block {}: {}", self.tree.name(), addr, e);
            }
        }
    }
}

fn kind_children(kind: &PageKind) -> usize {
    match kind {
        PageKind::RowInternal(intl) => intl.children.len(),
        PageKind::ColInternal(intl) => intl.children.len(),
        _ => 0,
    }
}
