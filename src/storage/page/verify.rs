//! Structural verification of disk images.
//!
//! Reads always validate the header and checksum. Verification goes further:
//! it walks every cell and checks the rules each page type imposes on its
//! cell stream.

use crate::config::{TreeConfig, TreeType};
use crate::storage::disk::BlockAddr;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::cell::{CellPayload, CellReader};
use crate::storage::page::{check_image, fix, image_body, PageHeader, PageType};
use bytes::Bytes;

fn fail(addr: BlockAddr, header: &PageHeader, reason: impl AsRef<str>) -> StorageError {
    StorageError::corruption(format!(
        "{} page at {}: {}",
        header.page_type,
        addr,
        reason.as_ref()
    ))
}

pub fn verify_image(image: &Bytes, addr: BlockAddr, config: &TreeConfig) -> StorageResult<()> {
    let header = check_image(image, addr.size)?;
    let body = image_body(image, &header);

    match header.page_type {
        PageType::Overflow => {
            if header.entries as usize != body.len() {
                return Err(fail(
                    addr,
                    &header,
                    format!(
                        "overflow length {} does not match body length {}",
                        header.entries,
                        body.len()
                    ),
                ));
            }
            Ok(())
        }
        PageType::Freelist => {
            if header.entries as usize * 8 != body.len() {
                return Err(fail(addr, &header, "freelist entry count mismatch"));
            }
            Ok(())
        }
        PageType::ColFix => {
            let TreeType::ColumnFixed { bitcnt } = config.tree_type else {
                return Err(fail(addr, &header, "fixed-length page in a non-fixed tree"));
            };
            if header.recno == 0 {
                return Err(fail(addr, &header, "record number 0"));
            }
            if fix::packed_len(header.entries as u64, bitcnt) != body.len() {
                return Err(fail(addr, &header, "bitfield length mismatch"));
            }
            Ok(())
        }
        page_type => verify_cells(addr, &header, body, page_type),
    }
}

fn verify_cells(
    addr: BlockAddr,
    header: &PageHeader,
    body: Bytes,
    page_type: PageType,
) -> StorageResult<()> {
    let mut count = 0u32;
    let mut last_key: Option<Bytes> = None;
    let mut last_recno = 0u64;
    let mut expect_addr = false;
    let mut prev_was_key = false;

    for cell in CellReader::new(body, page_type) {
        let cell = cell.map_err(|e| fail(addr, header, e.to_string()))?;
        count += 1;

        match (page_type, &cell.payload) {
            (PageType::RowLeaf, CellPayload::Key(key)) => {
                if let Some(last) = &last_key {
                    if key <= last {
                        return Err(fail(
                            addr,
                            header,
                            format!("key at cell {count} is not greater than its predecessor"),
                        ));
                    }
                }
                last_key = Some(key.clone());
                prev_was_key = true;
            }
            (PageType::RowLeaf, CellPayload::KeyOverflow(_)) => {
                // Overflow keys are ordered against their neighbours when read.
                last_key = None;
                prev_was_key = true;
            }
            (PageType::RowLeaf, CellPayload::Value(_) | CellPayload::ValueOverflow(_)) => {
                if !prev_was_key {
                    return Err(fail(
                        addr,
                        header,
                        format!("value at cell {count} does not follow a key"),
                    ));
                }
                prev_was_key = false;
            }
            (PageType::RowInt, CellPayload::Key(_) | CellPayload::KeyOverflow(_)) => {
                if expect_addr {
                    return Err(fail(addr, header, "two keys without a child address"));
                }
                expect_addr = true;
            }
            (PageType::RowInt, CellPayload::Addr { .. }) => {
                if !expect_addr {
                    return Err(fail(addr, header, "child address without a key"));
                }
                expect_addr = false;
            }
            (PageType::ColInt, CellPayload::Addr { recno: Some(recno), .. }) => {
                if *recno == 0 || *recno <= last_recno {
                    return Err(fail(
                        addr,
                        header,
                        format!("child record number {recno} is not increasing"),
                    ));
                }
                if count == 1 && *recno != header.recno {
                    return Err(fail(
                        addr,
                        header,
                        "first child record number does not match the page",
                    ));
                }
                last_recno = *recno;
            }
            (
                PageType::ColVar,
                CellPayload::Value(_) | CellPayload::ValueOverflow(_) | CellPayload::Deleted,
            ) => {}
            (_, payload) => {
                return Err(fail(
                    addr,
                    header,
                    format!("unexpected cell {payload:?} at cell {count}"),
                ));
            }
        }
    }

    if page_type == PageType::RowInt && expect_addr {
        return Err(fail(addr, header, "trailing key without a child address"));
    }
    if count != header.entries {
        return Err(fail(
            addr,
            header,
            format!("found {count} cells, header says {}", header.entries),
        ));
    }
    if page_type.is_internal() && count == 0 {
        return Err(fail(addr, header, "internal page with no children"));
    }
    Ok(())
}
