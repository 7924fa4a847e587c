//! On-disk page layout.
//!
//! Every block starts with a fixed 36 byte header followed by the page body:
//!
//! ```text
//! offset  size  field
//!      0     8  starting record number (column stores)
//!      8     8  log sequence number
//!     16     4  checksum (crc32 of the block with this field zeroed)
//!     20     4  on-disk size (allocation aligned)
//!     24     4  in-memory size (header plus body, unpadded)
//!     28     4  entries / overflow data length
//!     32     1  page type
//!     33     3  padding
//! ```

pub mod cell;
pub mod fix;
pub mod verify;

use crate::storage::error::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use std::fmt;

pub const PAGE_HEADER_SIZE: usize = 36;

const OFF_RECNO: usize = 0;
const OFF_LSN: usize = 8;
const OFF_CHECKSUM: usize = 16;
const OFF_SIZE: usize = 20;
const OFF_MEMSIZE: usize = 24;
const OFF_ENTRIES: usize = 28;
const OFF_TYPE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    ColFix = 1,
    ColInt = 2,
    ColVar = 3,
    Overflow = 4,
    RowInt = 5,
    RowLeaf = 6,
    Freelist = 7,
}

impl PageType {
    pub fn is_leaf(&self) -> bool {
        matches!(self, PageType::ColFix | PageType::ColVar | PageType::RowLeaf)
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, PageType::ColInt | PageType::RowInt)
    }
}

impl TryFrom<u8> for PageType {
    type Error = StorageError;

    fn try_from(value: u8) -> StorageResult<Self> {
        Ok(match value {
            1 => PageType::ColFix,
            2 => PageType::ColInt,
            3 => PageType::ColVar,
            4 => PageType::Overflow,
            5 => PageType::RowInt,
            6 => PageType::RowLeaf,
            7 => PageType::Freelist,
            other => {
                return Err(StorageError::corruption(format!(
                    "unknown page type {other}"
                )))
            }
        })
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageType::ColFix => "column-fixed leaf",
            PageType::ColInt => "column internal",
            PageType::ColVar => "column-variable leaf",
            PageType::Overflow => "overflow",
            PageType::RowInt => "row internal",
            PageType::RowLeaf => "row leaf",
            PageType::Freelist => "freelist",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub recno: u64,
    pub lsn: u64,
    pub checksum: u32,
    pub size: u32,
    pub memsize: u32,
    pub entries: u32,
    pub page_type: PageType,
}

impl PageHeader {
    pub fn new(page_type: PageType) -> Self {
        Self {
            recno: 0,
            lsn: 0,
            checksum: 0,
            size: 0,
            memsize: 0,
            entries: 0,
            page_type,
        }
    }

    pub fn read(buf: &[u8]) -> StorageResult<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(StorageError::corruption(format!(
                "block of {} bytes is shorter than the page header",
                buf.len()
            )));
        }
        Ok(Self {
            recno: LittleEndian::read_u64(&buf[OFF_RECNO..]),
            lsn: LittleEndian::read_u64(&buf[OFF_LSN..]),
            checksum: LittleEndian::read_u32(&buf[OFF_CHECKSUM..]),
            size: LittleEndian::read_u32(&buf[OFF_SIZE..]),
            memsize: LittleEndian::read_u32(&buf[OFF_MEMSIZE..]),
            entries: LittleEndian::read_u32(&buf[OFF_ENTRIES..]),
            page_type: PageType::try_from(buf[OFF_TYPE])?,
        })
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[OFF_RECNO..], self.recno);
        LittleEndian::write_u64(&mut buf[OFF_LSN..], self.lsn);
        LittleEndian::write_u32(&mut buf[OFF_CHECKSUM..], self.checksum);
        LittleEndian::write_u32(&mut buf[OFF_SIZE..], self.size);
        LittleEndian::write_u32(&mut buf[OFF_MEMSIZE..], self.memsize);
        LittleEndian::write_u32(&mut buf[OFF_ENTRIES..], self.entries);
        buf[OFF_TYPE] = self.page_type as u8;
        buf[OFF_TYPE + 1..PAGE_HEADER_SIZE].fill(0);
    }
}

/// Checksum of a block, computed with the checksum field treated as zero.
pub fn block_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..OFF_CHECKSUM]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[OFF_CHECKSUM + 4..]);
    hasher.finalize()
}

/// A working buffer with space reserved for the page header.
pub fn new_image(capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(capacity.max(PAGE_HEADER_SIZE));
    buf.resize(PAGE_HEADER_SIZE, 0);
    buf
}

/// Pad the image to the allocation size, write the header and checksum.
pub fn finish_image(mut buf: BytesMut, mut header: PageHeader, allocation_size: u32) -> Bytes {
    let memsize = buf.len();
    let alloc = allocation_size as usize;
    let size = memsize.div_ceil(alloc) * alloc;
    buf.resize(size, 0);

    header.memsize = memsize as u32;
    header.size = size as u32;
    header.checksum = 0;
    header.write(&mut buf);
    let checksum = block_checksum(&buf);
    LittleEndian::write_u32(&mut buf[OFF_CHECKSUM..], checksum);
    buf.freeze()
}

/// Validate a block read from disk: header, sizes and checksum.
pub fn check_image(buf: &[u8], expected_size: u32) -> StorageResult<PageHeader> {
    let header = PageHeader::read(buf)?;
    if header.size != expected_size || buf.len() != expected_size as usize {
        return Err(StorageError::corruption(format!(
            "{} page size {} does not match the block size {}",
            header.page_type, header.size, expected_size
        )));
    }
    if (header.memsize as usize) < PAGE_HEADER_SIZE || header.memsize > header.size {
        return Err(StorageError::corruption(format!(
            "{} page memory size {} is outside the block",
            header.page_type, header.memsize
        )));
    }
    let checksum = block_checksum(buf);
    if checksum != header.checksum {
        return Err(StorageError::corruption(format!(
            "{} page checksum mismatch: stored {:#010x}, computed {:#010x}",
            header.page_type, header.checksum, checksum
        )));
    }
    Ok(header)
}

/// The page body following the header, excluding padding.
pub fn image_body(buf: &Bytes, header: &PageHeader) -> Bytes {
    buf.slice(PAGE_HEADER_SIZE..header.memsize as usize)
}
