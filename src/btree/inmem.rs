//! Build in-memory pages from disk images.

use crate::btree::key::RowKey;
use crate::btree::page::{
    ColChild, ColFixLeaf, ColInternal, ColVarLeaf, ColVarSlot, Page, PageKind, RowChild,
    RowInternal, RowLeaf, RowSlot,
};
use crate::btree::reference::PageRef;
use crate::btree::BTree;
use crate::config::TreeType;
use crate::storage::disk::BlockAddr;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cell::{Cell, CellPayload, CellReader};
use crate::storage::page::{fix, image_body, PageHeader, PageType};
use bytes::Bytes;
use std::sync::{Arc, Weak};

fn corrupt(addr: BlockAddr, header: &PageHeader, reason: impl AsRef<str>) -> StorageError {
    StorageError::corruption(format!(
        "{} page at {}: {}",
        header.page_type,
        addr,
        reason.as_ref()
    ))
}

/// Decode a validated image into a page.
///
/// The caller has already checked the header and checksum; this rejects
/// images whose cell stream disagrees with the header or the tree type.
pub(crate) fn page_from_image(
    tree: &BTree,
    image: Bytes,
    addr: BlockAddr,
    parent: Weak<Page>,
    pref: &Arc<PageRef>,
    read_gen: u64,
) -> StorageResult<Page> {
    let header = PageHeader::read(&image)?;
    let body = image_body(&image, &header);
    let tree_type = tree.config().tree_type;

    let kind = match (header.page_type, tree_type) {
        (PageType::RowInt, TreeType::Row) => row_internal(tree, &header, addr, body)?,
        (PageType::RowLeaf, TreeType::Row) => row_leaf(tree, &header, addr, body)?,
        (PageType::ColInt, TreeType::ColumnFixed { .. } | TreeType::ColumnVariable) => {
            col_internal(&header, addr, body)?
        }
        (PageType::ColFix, TreeType::ColumnFixed { bitcnt }) => {
            if header.recno == 0 {
                return Err(corrupt(addr, &header, "record number 0"));
            }
            if fix::packed_len(header.entries as u64, bitcnt) != body.len() {
                return Err(corrupt(addr, &header, "bitfield length does not match entries"));
            }
            PageKind::ColFixLeaf(ColFixLeaf::new(
                header.recno,
                header.entries as u64,
                bitcnt,
                body,
            ))
        }
        (PageType::ColVar, TreeType::ColumnVariable) => col_var(&header, addr, body)?,
        (page_type, tree_type) => {
            return Err(corrupt(
                addr,
                &header,
                format!("{page_type} page cannot appear in a {tree_type:?} tree"),
            ))
        }
    };

    Ok(Page::new(
        kind,
        parent,
        Arc::downgrade(pref),
        Some(image),
        read_gen,
    ))
}

fn cells(header: &PageHeader, addr: BlockAddr, body: Bytes) -> StorageResult<Vec<Cell>> {
    let cells = CellReader::new(body, header.page_type)
        .collect::<StorageResult<Vec<_>>>()
        .map_err(|e| corrupt(addr, header, e.to_string()))?;
    if cells.len() != header.entries as usize {
        return Err(corrupt(
            addr,
            header,
            format!("{} cells, header says {}", cells.len(), header.entries),
        ));
    }
    Ok(cells)
}

fn row_internal(
    tree: &BTree,
    header: &PageHeader,
    addr: BlockAddr,
    body: Bytes,
) -> StorageResult<PageKind> {
    let encoded = tree.codecs().key.is_some();
    let mut children = Vec::with_capacity(header.entries as usize / 2);
    let mut cells = cells(header, addr, body)?.into_iter();

    while let Some(key) = cells.next() {
        if !key.payload.is_key() {
            return Err(corrupt(addr, header, "expected a key cell"));
        }
        let child = match cells.next() {
            Some(Cell {
                payload: CellPayload::Addr { addr, .. },
                ..
            }) => addr,
            _ => return Err(corrupt(addr, header, "key without a child address")),
        };
        children.push(RowChild {
            key: RowKey::from_cell(key, encoded),
            pref: PageRef::on_disk(child),
        });
    }

    if children.is_empty() {
        return Err(corrupt(addr, header, "internal page with no children"));
    }
    Ok(PageKind::RowInternal(RowInternal { children }))
}

fn row_leaf(
    tree: &BTree,
    header: &PageHeader,
    addr: BlockAddr,
    body: Bytes,
) -> StorageResult<PageKind> {
    let encoded = tree.codecs().key.is_some();
    let mut rows: Vec<RowSlot> = Vec::with_capacity(header.entries as usize / 2);

    for cell in cells(header, addr, body)? {
        match &cell.payload {
            CellPayload::Key(_) | CellPayload::KeyOverflow(_) => rows.push(RowSlot {
                key: RowKey::from_cell(cell, encoded),
                value: None,
            }),
            CellPayload::Value(_) | CellPayload::ValueOverflow(_) => match rows.last_mut() {
                Some(row) if row.value.is_none() => row.value = Some(cell),
                _ => return Err(corrupt(addr, header, "value cell without a key")),
            },
            other => {
                return Err(corrupt(
                    addr,
                    header,
                    format!("unexpected cell {other:?} on a row leaf"),
                ))
            }
        }
    }
    Ok(PageKind::RowLeaf(RowLeaf::new(rows)))
}

fn col_internal(header: &PageHeader, addr: BlockAddr, body: Bytes) -> StorageResult<PageKind> {
    let mut children: Vec<ColChild> = Vec::with_capacity(header.entries as usize);
    for cell in cells(header, addr, body)? {
        let CellPayload::Addr {
            addr: child,
            recno: Some(recno),
        } = cell.payload
        else {
            return Err(corrupt(addr, header, "expected a child address cell"));
        };
        if children.last().is_some_and(|last| last.recno >= recno) {
            return Err(corrupt(addr, header, "child record numbers out of order"));
        }
        children.push(ColChild {
            recno,
            pref: PageRef::on_disk(child),
        });
    }

    match children.first() {
        None => Err(corrupt(addr, header, "internal page with no children")),
        Some(first) if first.recno != header.recno => Err(corrupt(
            addr,
            header,
            "first child record number does not match the page",
        )),
        Some(_) => Ok(PageKind::ColInternal(ColInternal {
            recno: header.recno,
            children,
        })),
    }
}

fn col_var(header: &PageHeader, addr: BlockAddr, body: Bytes) -> StorageResult<PageKind> {
    if header.recno == 0 {
        return Err(corrupt(addr, header, "record number 0"));
    }
    let mut recno = header.recno;
    let mut slots = Vec::with_capacity(header.entries as usize);
    for cell in cells(header, addr, body)? {
        if !cell.payload.is_value() {
            return Err(corrupt(addr, header, "non-value cell on a column leaf"));
        }
        let rle = cell.rle;
        slots.push(ColVarSlot { recno, cell });
        recno = recno
            .checked_add(rle)
            .ok_or_else(|| corrupt(addr, header, "record numbers overflow"))?;
    }
    Ok(PageKind::ColVarLeaf(ColVarLeaf::new(header.recno, slots)))
}
