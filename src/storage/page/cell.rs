//! Cell encoding for page bodies.
//!
//! The first byte of a cell is its descriptor. The two low bits select the
//! form:
//!
//! - `01`: short key, length (0..=63) in the upper six bits
//! - `10`: short value, length in the upper six bits
//! - `00`: long cell, type in the upper four bits, `0x08` flags a run-length
//! - `11`: never written
//!
//! Long cell payloads: keys and values carry a LEB128 length and the bytes,
//! overflow references and child addresses carry `addr u32, size u32`, child
//! addresses on column internal pages add a LEB128 starting record number.

use crate::storage::disk::BlockAddr;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageType;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

const FORM_MASK: u8 = 0x03;
const FORM_LONG: u8 = 0x00;
const FORM_SHORT_KEY: u8 = 0x01;
const FORM_SHORT_VALUE: u8 = 0x02;
const RLE_FLAG: u8 = 0x08;

pub const SHORT_MAX: usize = 63;

const TYPE_ADDR: u8 = 1;
const TYPE_DELETED: u8 = 2;
const TYPE_KEY: u8 = 3;
const TYPE_KEY_OVFL: u8 = 4;
const TYPE_VALUE: u8 = 5;
const TYPE_VALUE_OVFL: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellPayload {
    Key(Bytes),
    KeyOverflow(BlockAddr),
    Value(Bytes),
    ValueOverflow(BlockAddr),
    Deleted,
    Addr { addr: BlockAddr, recno: Option<u64> },
}

impl CellPayload {
    pub fn is_key(&self) -> bool {
        matches!(self, CellPayload::Key(_) | CellPayload::KeyOverflow(_))
    }

    pub fn is_value(&self) -> bool {
        matches!(
            self,
            CellPayload::Value(_) | CellPayload::ValueOverflow(_) | CellPayload::Deleted
        )
    }

    pub fn overflow(&self) -> Option<BlockAddr> {
        match self {
            CellPayload::KeyOverflow(addr) | CellPayload::ValueOverflow(addr) => Some(*addr),
            _ => None,
        }
    }
}

/// A decoded cell, together with its raw encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub payload: CellPayload,
    pub rle: u64,
    pub raw: Bytes,
}

pub fn put_varint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

pub fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

pub fn get_varint(buf: &[u8], pos: &mut usize) -> StorageResult<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| StorageError::corruption("varint runs past the end of the page"))?;
        *pos += 1;
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(StorageError::corruption("varint is longer than 64 bits"))
}

fn put_long(buf: &mut BytesMut, cell_type: u8, rle: u64) {
    if rle > 1 {
        buf.put_u8(cell_type << 4 | RLE_FLAG);
        put_varint(buf, rle);
    } else {
        buf.put_u8(cell_type << 4);
    }
}

fn put_addr(buf: &mut BytesMut, addr: BlockAddr) {
    buf.put_u32_le(addr.addr);
    buf.put_u32_le(addr.size);
}

pub fn encode_key(buf: &mut BytesMut, key: &[u8]) {
    if key.len() <= SHORT_MAX {
        buf.put_u8((key.len() as u8) << 2 | FORM_SHORT_KEY);
    } else {
        put_long(buf, TYPE_KEY, 1);
        put_varint(buf, key.len() as u64);
    }
    buf.put_slice(key);
}

pub fn encode_value(buf: &mut BytesMut, value: &[u8], rle: u64) {
    if rle <= 1 && value.len() <= SHORT_MAX {
        buf.put_u8((value.len() as u8) << 2 | FORM_SHORT_VALUE);
    } else {
        put_long(buf, TYPE_VALUE, rle);
        put_varint(buf, value.len() as u64);
    }
    buf.put_slice(value);
}

pub fn encode_key_overflow(buf: &mut BytesMut, addr: BlockAddr) {
    put_long(buf, TYPE_KEY_OVFL, 1);
    put_addr(buf, addr);
}

pub fn encode_value_overflow(buf: &mut BytesMut, addr: BlockAddr, rle: u64) {
    put_long(buf, TYPE_VALUE_OVFL, rle);
    put_addr(buf, addr);
}

pub fn encode_deleted(buf: &mut BytesMut, rle: u64) {
    put_long(buf, TYPE_DELETED, rle);
}

pub fn encode_addr(buf: &mut BytesMut, addr: BlockAddr, recno: Option<u64>) {
    put_long(buf, TYPE_ADDR, 1);
    put_addr(buf, addr);
    if let Some(recno) = recno {
        put_varint(buf, recno);
    }
}

/// Re-encode a cell with a different run-length count.
pub fn encode_with_rle(buf: &mut BytesMut, payload: &CellPayload, rle: u64) {
    match payload {
        CellPayload::Value(data) => encode_value(buf, data, rle),
        CellPayload::ValueOverflow(addr) => encode_value_overflow(buf, *addr, rle),
        CellPayload::Deleted => encode_deleted(buf, rle),
        CellPayload::Key(data) => encode_key(buf, data),
        CellPayload::KeyOverflow(addr) => encode_key_overflow(buf, *addr),
        CellPayload::Addr { addr, recno } => encode_addr(buf, *addr, *recno),
    }
}

/// Iterates the cells of a page body.
pub struct CellReader {
    body: Bytes,
    pos: usize,
    addr_recno: bool,
}

impl CellReader {
    pub fn new(body: Bytes, page_type: PageType) -> Self {
        Self {
            body,
            pos: 0,
            addr_recno: page_type == PageType::ColInt,
        }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> StorageResult<Bytes> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.body.len())
            .ok_or_else(|| {
                StorageError::corruption(format!(
                    "cell at offset {} extends past the end of the page",
                    self.pos
                ))
            })?;
        let out = self.body.slice(self.pos..end);
        self.pos = end;
        Ok(out)
    }

    fn take_addr(&mut self) -> StorageResult<BlockAddr> {
        let raw = self.take(8)?;
        Ok(BlockAddr::new(
            LittleEndian::read_u32(&raw[0..4]),
            LittleEndian::read_u32(&raw[4..8]),
        ))
    }

    fn read_cell(&mut self) -> StorageResult<Cell> {
        let start = self.pos;
        let desc = self.body[self.pos];
        self.pos += 1;

        let mut rle = 1;
        let payload = match desc & FORM_MASK {
            FORM_SHORT_KEY => CellPayload::Key(self.take((desc >> 2) as usize)?),
            FORM_SHORT_VALUE => CellPayload::Value(self.take((desc >> 2) as usize)?),
            FORM_LONG => {
                if desc & RLE_FLAG != 0 {
                    rle = get_varint(&self.body, &mut self.pos)?;
                    if rle == 0 {
                        return Err(StorageError::corruption(format!(
                            "cell at offset {start} has a zero run length"
                        )));
                    }
                }
                match desc >> 4 {
                    TYPE_ADDR => {
                        let addr = self.take_addr()?;
                        let recno = if self.addr_recno {
                            Some(get_varint(&self.body, &mut self.pos)?)
                        } else {
                            None
                        };
                        CellPayload::Addr { addr, recno }
                    }
                    TYPE_DELETED => CellPayload::Deleted,
                    TYPE_KEY => {
                        let len = get_varint(&self.body, &mut self.pos)? as usize;
                        CellPayload::Key(self.take(len)?)
                    }
                    TYPE_KEY_OVFL => CellPayload::KeyOverflow(self.take_addr()?),
                    TYPE_VALUE => {
                        let len = get_varint(&self.body, &mut self.pos)? as usize;
                        CellPayload::Value(self.take(len)?)
                    }
                    TYPE_VALUE_OVFL => CellPayload::ValueOverflow(self.take_addr()?),
                    other => {
                        return Err(StorageError::corruption(format!(
                            "illegal cell type {other} at offset {start}"
                        )))
                    }
                }
            }
            _ => {
                return Err(StorageError::corruption(format!(
                    "illegal cell descriptor {desc:#04x} at offset {start}"
                )))
            }
        };

        if rle > 1 && !payload.is_value() {
            return Err(StorageError::corruption(format!(
                "run length on a non-value cell at offset {start}"
            )));
        }

        Ok(Cell {
            payload,
            rle,
            raw: self.body.slice(start..self.pos),
        })
    }
}

impl Iterator for CellReader {
    type Item = StorageResult<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.body.len() {
            return None;
        }
        let result = self.read_cell();
        if result.is_err() {
            // Stop after the first malformed cell.
            self.pos = self.body.len();
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(buf: BytesMut, page_type: PageType) -> Vec<Cell> {
        CellReader::new(buf.freeze(), page_type)
            .collect::<StorageResult<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_short_and_long_forms() {
        let long_key = vec![b'k'; 100];
        let mut buf = BytesMut::new();
        encode_key(&mut buf, b"abc");
        encode_value(&mut buf, b"", 1);
        encode_key(&mut buf, &long_key);
        encode_value(&mut buf, &[7u8; 64], 1);

        let cells = read_all(buf, PageType::RowLeaf);
        assert_eq!(cells.len(), 4);
        assert_eq!(cells[0].raw.len(), 4);
        assert_eq!(cells[0].payload, CellPayload::Key(Bytes::from_static(b"abc")));
        assert_eq!(cells[1].payload, CellPayload::Value(Bytes::new()));
        assert_eq!(cells[2].payload, CellPayload::Key(Bytes::from(long_key)));
        assert_eq!(cells[3].payload, CellPayload::Value(Bytes::from(vec![7u8; 64])));
    }

    #[test]
    fn test_run_length_values() {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, b"x", 300);
        encode_deleted(&mut buf, 5);
        encode_value_overflow(&mut buf, BlockAddr::new(9, 512), 2);

        let cells = read_all(buf, PageType::ColVar);
        assert_eq!(cells[0].rle, 300);
        assert_eq!(cells[0].payload, CellPayload::Value(Bytes::from_static(b"x")));
        assert_eq!(cells[1].rle, 5);
        assert_eq!(cells[1].payload, CellPayload::Deleted);
        assert_eq!(cells[2].payload.overflow(), Some(BlockAddr::new(9, 512)));
    }

    #[test]
    fn test_addr_cells_carry_recno_on_column_internal() {
        let mut buf = BytesMut::new();
        encode_addr(&mut buf, BlockAddr::new(3, 1024), Some(101));
        let cells = read_all(buf, PageType::ColInt);
        assert_eq!(
            cells[0].payload,
            CellPayload::Addr {
                addr: BlockAddr::new(3, 1024),
                recno: Some(101)
            }
        );

        let mut buf = BytesMut::new();
        encode_addr(&mut buf, BlockAddr::new(3, 1024), None);
        let cells = read_all(buf, PageType::RowInt);
        assert_eq!(
            cells[0].payload,
            CellPayload::Addr {
                addr: BlockAddr::new(3, 1024),
                recno: None
            }
        );
    }

    #[test]
    fn test_truncated_cell_is_corruption() {
        let mut buf = BytesMut::new();
        encode_key(&mut buf, b"abcdef");
        let truncated = buf.freeze().slice(0..4);
        let result: StorageResult<Vec<_>> =
            CellReader::new(truncated, PageType::RowLeaf).collect();
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_illegal_descriptor() {
        let body = Bytes::from_static(&[0x03]);
        let result: StorageResult<Vec<_>> = CellReader::new(body, PageType::RowLeaf).collect();
        assert!(result.is_err());

        let body = Bytes::from_static(&[0xf0]);
        let result: StorageResult<Vec<_>> = CellReader::new(body, PageType::RowLeaf).collect();
        assert!(result.is_err());
    }

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, v);
            assert_eq!(buf.len(), varint_len(v));
            let mut pos = 0;
            assert_eq!(get_varint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }
}
