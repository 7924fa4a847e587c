//! Overflow items: keys and values too large for their page.

use crate::btree::BTree;
use crate::storage::disk::BlockAddr;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{self, PageHeader, PageType, PAGE_HEADER_SIZE};
use bytes::{BufMut, Bytes};
use log::trace;
use std::sync::atomic::Ordering;

pub(crate) fn read(tree: &BTree, addr: BlockAddr) -> StorageResult<Bytes> {
    let image = tree.store().read(addr)?;
    let header = page::check_image(&image, addr.size)?;
    if header.page_type != PageType::Overflow {
        return Err(StorageError::corruption(format!(
            "overflow reference {addr} points at a {} page",
            header.page_type
        )));
    }
    let len = header.entries as usize;
    if PAGE_HEADER_SIZE + len != header.memsize as usize {
        return Err(StorageError::corruption(format!(
            "overflow item at {addr} has length {len} but the page holds {}",
            header.memsize as usize - PAGE_HEADER_SIZE
        )));
    }
    tree.stats.overflow_reads.fetch_add(1, Ordering::Relaxed);
    trace!("read overflow item {} ({} bytes)", addr, len);
    Ok(image.slice(PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len))
}

pub(crate) fn write(tree: &BTree, data: &[u8]) -> StorageResult<BlockAddr> {
    let len = u32::try_from(data.len()).map_err(|_| StorageError::ItemTooLarge { size: data.len() })?;
    let mut buf = page::new_image(PAGE_HEADER_SIZE + data.len());
    buf.put_slice(data);
    let mut header = PageHeader::new(PageType::Overflow);
    header.lsn = tree.lsn();
    header.entries = len;
    let image = page::finish_image(buf, header, tree.config().allocation_size);
    let addr = tree.store().write(&image)?;
    tree.stats.overflow_writes.fetch_add(1, Ordering::Relaxed);
    trace!("wrote overflow item {} ({} bytes)", addr, len);
    Ok(addr)
}
