//! Session allocation buffers.
//!
//! Values written into pages are copied into per-session chunks and handed
//! out as [`Bytes`]. A chunk is freed once every item carved from it has
//! been dropped, so memory tracks the longest-lived update rather than
//! needing an explicit owner.

use bytes::{Bytes, BytesMut};

#[derive(Debug)]
pub struct SessionBuffer {
    chunk: BytesMut,
    next_size: usize,
    max_size: usize,
    chunks_allocated: u64,
}

impl SessionBuffer {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            chunk: BytesMut::new(),
            next_size: min_size,
            max_size,
            chunks_allocated: 0,
        }
    }

    /// Copy `data` into session memory.
    pub fn alloc(&mut self, data: &[u8]) -> Bytes {
        // Items larger than any chunk get their own allocation.
        if data.len() > self.max_size {
            return Bytes::copy_from_slice(data);
        }

        if self.chunk.capacity() - self.chunk.len() < data.len() {
            // Large items grow the next chunk so a run of them shares memory.
            while self.next_size < data.len() && self.next_size < self.max_size {
                self.next_size *= 2;
            }
            let size = self.next_size.min(self.max_size).max(data.len());
            self.chunk = BytesMut::with_capacity(size);
            self.chunks_allocated += 1;
            self.next_size = (self.next_size * 2).min(self.max_size);
        }

        self.chunk.extend_from_slice(data);
        self.chunk.split().freeze()
    }

    pub fn chunks_allocated(&self) -> u64 {
        self.chunks_allocated
    }

    pub fn remaining(&self) -> usize {
        self.chunk.capacity() - self.chunk.len()
    }
}
