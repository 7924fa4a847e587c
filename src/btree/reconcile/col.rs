use super::{Chunk, ChunkStart, Reconciler, UnitStart};
use crate::btree::page::{ColFixLeaf, ColInternal, ColVarLeaf};
use crate::codec::Codecs;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cell::{self, Cell, CellPayload};
use crate::storage::page::{self, fix, PageHeader, PageType, PAGE_HEADER_SIZE};
use bytes::{BufMut, Bytes};
use std::collections::HashSet;

/// The value of a run of records.
#[derive(Debug)]
enum RunValue<'a> {
    /// Unchanged on-page value.
    Cell(&'a Cell),
    /// A value from an update; `None` is deleted.
    Data(Option<Bytes>),
}

#[derive(Debug)]
struct Run<'a> {
    recno: u64,
    count: u64,
    value: RunValue<'a>,
}

struct Runs<'a> {
    runs: Vec<Run<'a>>,
    merge: bool,
    codecs: &'a Codecs,
}

impl<'a> Runs<'a> {
    fn push(&mut self, recno: u64, count: u64, value: RunValue<'a>) {
        if count == 0 {
            return;
        }
        // Deleted cells and deleted updates are the same thing.
        let value = match value {
            RunValue::Cell(Cell {
                payload: CellPayload::Deleted,
                ..
            }) => RunValue::Data(None),
            value => value,
        };
        if self.merge {
            let codecs = self.codecs;
            if let Some(last) = self.runs.last_mut() {
                if last.recno + last.count == recno && same_value(codecs, &last.value, &value) {
                    last.count += count;
                    return;
                }
            }
        }
        self.runs.push(Run {
            recno,
            count,
            value,
        });
    }
}

/// True if two runs hold the same value. On-page overflow values are
/// only compared with each other, by address.
fn same_value(codecs: &Codecs, a: &RunValue<'_>, b: &RunValue<'_>) -> bool {
    match (a, b) {
        (RunValue::Cell(a), RunValue::Cell(b)) => a.payload == b.payload,
        (RunValue::Data(a), RunValue::Data(b)) => a == b,
        (RunValue::Cell(cell), RunValue::Data(Some(data)))
        | (RunValue::Data(Some(data)), RunValue::Cell(cell)) => match &cell.payload {
            CellPayload::Value(stored) => codecs
                .encode_value(data)
                .is_ok_and(|encoded| encoded == *stored),
            _ => false,
        },
        _ => false,
    }
}

impl<'a> Reconciler<'a> {
    pub(super) fn col_internal(&mut self, intl: &'a ColInternal) -> StorageResult<()> {
        for child in &intl.children {
            let addr = child.pref.addr();
            if !addr.is_valid() {
                return Err(StorageError::busy(format!(
                    "child of page {:?} has not been written",
                    self.page.id()
                )));
            }
            let offset = self.begin_unit();
            cell::encode_addr(&mut self.buf, addr, Some(child.recno));
            self.end_unit(offset, UnitStart::Recno(child.recno), 1);
        }
        Ok(())
    }

    /// Records in order as runs of equal values, re-merging repeat groups
    /// that updates split apart.
    pub(super) fn col_var(&mut self, leaf: &'a ColVarLeaf) -> StorageResult<()> {
        let mut runs = Runs {
            runs: Vec::with_capacity(leaf.slots.len()),
            merge: self.tree.config().runlength_encoding,
            codecs: self.tree.codecs(),
        };
        // Split repeat groups share one overflow block between their cells.
        let mut live = HashSet::new();
        let mut dead = Vec::new();

        for (i, slot) in leaf.slots.iter().enumerate() {
            let end = slot.recno + slot.rle();
            let mut next = slot.recno;
            let mut kept = 0;
            if let Some(head) = leaf.updates(i) {
                for node in head.iter() {
                    let (Some(recno), Some(upd)) = (node.key().recno(), node.update()) else {
                        continue;
                    };
                    if recno < next || recno >= end {
                        continue;
                    }
                    kept += recno - next;
                    runs.push(next, recno - next, RunValue::Cell(&slot.cell));
                    runs.push(recno, 1, RunValue::Data(upd.value().cloned()));
                    next = recno + 1;
                }
            }
            kept += end - next;
            runs.push(next, end - next, RunValue::Cell(&slot.cell));
            match slot.cell.payload.overflow() {
                Some(addr) if kept > 0 => {
                    live.insert(addr);
                }
                Some(_) => dead.push(&slot.cell),
                None => {}
            }
        }
        for cell in dead {
            if cell.payload.overflow().is_some_and(|addr| !live.contains(&addr)) {
                self.supersede(cell);
            }
        }

        if let Some(head) = leaf.appends() {
            let mut next = leaf.last_recno() + 1;
            for node in head.iter() {
                let (Some(recno), Some(upd)) = (node.key().recno(), node.update()) else {
                    continue;
                };
                if recno < next {
                    continue;
                }
                runs.push(next, recno - next, RunValue::Data(None));
                runs.push(recno, 1, RunValue::Data(upd.value().cloned()));
                next = recno + 1;
            }
        }

        for run in runs.runs {
            let offset = self.begin_unit();
            match &run.value {
                RunValue::Cell(cell) if cell.rle == run.count => self.raw_cell(cell),
                RunValue::Cell(cell) => cell::encode_with_rle(&mut self.buf, &cell.payload, run.count),
                RunValue::Data(Some(value)) => self.value_cell(value, run.count)?,
                RunValue::Data(None) => cell::encode_deleted(&mut self.buf, run.count),
            }
            self.end_unit(offset, UnitStart::Recno(run.recno), 1);
        }
        Ok(())
    }

    /// Fixed-length leaves are written straight from the merged values.
    pub(super) fn col_fix(
        &mut self,
        leaf: &'a ColFixLeaf,
        max_entries: Option<u64>,
    ) -> StorageResult<Vec<Chunk>> {
        let mut values: Vec<u8> = (0..leaf.entries).map(|i| leaf.value(i)).collect();
        let byte = |value: Option<&Bytes>| value.and_then(|v| v.first().copied()).unwrap_or(0);

        for head in [leaf.updates(), leaf.appends()].into_iter().flatten() {
            for node in head.iter() {
                let (Some(recno), Some(upd)) = (node.key().recno(), node.update()) else {
                    continue;
                };
                let Some(index) = recno.checked_sub(leaf.recno) else {
                    continue;
                };
                let index = index as usize;
                if index >= values.len() {
                    values.resize(index + 1, 0);
                }
                values[index] = byte(upd.value());
            }
        }

        let (page_max, split_size) = self.page_max();
        let bitcnt = leaf.bitcnt;
        let per_page = |size: usize| ((size - PAGE_HEADER_SIZE) * 8 / bitcnt as usize).max(1);
        let whole = PAGE_HEADER_SIZE + fix::packed_len(values.len() as u64, bitcnt) <= page_max;
        let capacity = match max_entries {
            Some(max) => (max as usize).max(1),
            None if whole => values.len().max(1),
            None => per_page(split_size),
        };

        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + capacity).min(values.len());
            let packed = fix::pack(&values[start..end], bitcnt);
            let recno = leaf.recno + start as u64;

            let mut header = PageHeader::new(PageType::ColFix);
            header.lsn = self.tree.lsn();
            header.recno = recno;
            header.entries = (end - start) as u32;
            let mut buf = page::new_image(PAGE_HEADER_SIZE + packed.len());
            buf.put_slice(&packed);
            chunks.push(Chunk {
                image: page::finish_image(buf, header, self.tree.config().allocation_size),
                start: ChunkStart::Recno(recno),
            });

            start = end;
            if start >= values.len() {
                break;
            }
        }
        Ok(chunks)
    }
}
