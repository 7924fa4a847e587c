use crate::config::TreeConfig;
use crate::storage::disk::{BlockAddr, BlockStore, TreeMeta, DESC_SECTOR_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{self, PageHeader, PageType};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes};
use log::{debug, info};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const DESC_MAGIC: u32 = 120897;
const DESC_MAJOR: u16 = 0;
const DESC_MINOR: u16 = 1;

const OFF_MAGIC: usize = 0;
const OFF_MAJOR: usize = 4;
const OFF_MINOR: usize = 6;
const OFF_CHECKSUM: usize = 8;
const OFF_ALLOC: usize = 12;
const OFF_FREE_ADDR: usize = 16;
const OFF_FREE_SIZE: usize = 20;
const OFF_ROOT_ADDR: usize = 24;
const OFF_ROOT_SIZE: usize = 28;
const OFF_LSN: usize = 32;
const OFF_CONFIG_LEN: usize = 40;
const OFF_CONFIG: usize = 44;

/// The file's description record.
#[derive(Debug, Clone)]
struct Desc {
    allocation_size: u32,
    free: BlockAddr,
    root: BlockAddr,
    lsn: u64,
    config: Option<TreeConfig>,
}

impl Desc {
    fn encode(&self) -> StorageResult<[u8; DESC_SECTOR_SIZE as usize]> {
        let mut buf = [0u8; DESC_SECTOR_SIZE as usize];
        LittleEndian::write_u32(&mut buf[OFF_MAGIC..], DESC_MAGIC);
        LittleEndian::write_u16(&mut buf[OFF_MAJOR..], DESC_MAJOR);
        LittleEndian::write_u16(&mut buf[OFF_MINOR..], DESC_MINOR);
        LittleEndian::write_u32(&mut buf[OFF_ALLOC..], self.allocation_size);
        LittleEndian::write_u32(&mut buf[OFF_FREE_ADDR..], self.free.addr);
        LittleEndian::write_u32(&mut buf[OFF_FREE_SIZE..], self.free.size);
        LittleEndian::write_u32(&mut buf[OFF_ROOT_ADDR..], self.root.addr);
        LittleEndian::write_u32(&mut buf[OFF_ROOT_SIZE..], self.root.size);
        LittleEndian::write_u64(&mut buf[OFF_LSN..], self.lsn);

        let config = match &self.config {
            Some(config) => bincode::serialize(config)?,
            None => Vec::new(),
        };
        if OFF_CONFIG + config.len() > buf.len() {
            return Err(StorageError::InvalidConfig(format!(
                "serialized tree configuration of {} bytes does not fit the description record",
                config.len()
            )));
        }
        LittleEndian::write_u32(&mut buf[OFF_CONFIG_LEN..], config.len() as u32);
        buf[OFF_CONFIG..OFF_CONFIG + config.len()].copy_from_slice(&config);

        let checksum = crc32fast::hash(&buf);
        LittleEndian::write_u32(&mut buf[OFF_CHECKSUM..], checksum);
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> StorageResult<Self> {
        if LittleEndian::read_u32(&buf[OFF_MAGIC..]) != DESC_MAGIC {
            return Err(StorageError::corruption("description record has a bad magic number"));
        }
        let major = LittleEndian::read_u16(&buf[OFF_MAJOR..]);
        let minor = LittleEndian::read_u16(&buf[OFF_MINOR..]);
        if major > DESC_MAJOR || (major == DESC_MAJOR && minor > DESC_MINOR) {
            return Err(StorageError::corruption(format!(
                "unsupported file version {major}.{minor}"
            )));
        }

        let stored = LittleEndian::read_u32(&buf[OFF_CHECKSUM..]);
        let mut copy = [0u8; DESC_SECTOR_SIZE as usize];
        copy.copy_from_slice(&buf[..DESC_SECTOR_SIZE as usize]);
        copy[OFF_CHECKSUM..OFF_CHECKSUM + 4].fill(0);
        if crc32fast::hash(&copy) != stored {
            return Err(StorageError::corruption("description record checksum mismatch"));
        }

        let config_len = LittleEndian::read_u32(&buf[OFF_CONFIG_LEN..]) as usize;
        if OFF_CONFIG + config_len > DESC_SECTOR_SIZE as usize {
            return Err(StorageError::corruption("description record configuration overruns"));
        }
        let config = if config_len == 0 {
            None
        } else {
            Some(bincode::deserialize(&buf[OFF_CONFIG..OFF_CONFIG + config_len])?)
        };

        Ok(Self {
            allocation_size: LittleEndian::read_u32(&buf[OFF_ALLOC..]),
            free: BlockAddr::new(
                LittleEndian::read_u32(&buf[OFF_FREE_ADDR..]),
                LittleEndian::read_u32(&buf[OFF_FREE_SIZE..]),
            ),
            root: BlockAddr::new(
                LittleEndian::read_u32(&buf[OFF_ROOT_ADDR..]),
                LittleEndian::read_u32(&buf[OFF_ROOT_SIZE..]),
            ),
            lsn: LittleEndian::read_u64(&buf[OFF_LSN..]),
            config,
        })
    }
}

#[derive(Debug)]
struct BlockFile {
    file: File,
    desc: Desc,
    /// Free extents sorted by address, never adjacent.
    free: Vec<BlockAddr>,
    /// Allocation units in use past the description sector.
    file_units: u32,
}

/// File-backed block storage with a persistent free list.
#[derive(Debug)]
pub struct FileBlockManager {
    inner: Mutex<BlockFile>,
    allocation_size: u32,
    reads: AtomicU64,
    writes: AtomicU64,
}

fn invalid_input(msg: String) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}

impl FileBlockManager {
    pub fn create(path: &Path, allocation_size: u32) -> StorageResult<Self> {
        if !allocation_size.is_power_of_two() || allocation_size < DESC_SECTOR_SIZE as u32 {
            return Err(StorageError::InvalidConfig(format!(
                "allocation size {allocation_size} must be a power of two of at least {DESC_SECTOR_SIZE}"
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let desc = Desc {
            allocation_size,
            free: BlockAddr::INVALID,
            root: BlockAddr::INVALID,
            lsn: 0,
            config: None,
        };
        file.write_all(&desc.encode()?)?;
        file.sync_all()?;
        info!("created block file {:?}, allocation size {}", path, allocation_size);

        Ok(Self {
            inner: Mutex::new(BlockFile {
                file,
                desc,
                free: Vec::new(),
                file_units: 0,
            }),
            allocation_size,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut buf = [0u8; DESC_SECTOR_SIZE as usize];
        file.read_exact(&mut buf)?;
        let desc = Desc::decode(&buf)?;
        let allocation_size = desc.allocation_size;
        if !allocation_size.is_power_of_two() || allocation_size < DESC_SECTOR_SIZE as u32 {
            return Err(StorageError::corruption(format!(
                "description record allocation size {allocation_size} is invalid"
            )));
        }

        let file_len = file.metadata()?.len();
        let file_units =
            (file_len.saturating_sub(DESC_SECTOR_SIZE) / allocation_size as u64) as u32;

        let manager = Self {
            inner: Mutex::new(BlockFile {
                file,
                desc,
                free: Vec::new(),
                file_units,
            }),
            allocation_size,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        };
        manager.load_free_list()?;
        info!(
            "opened block file {:?}: {} units, {} free extents",
            path,
            file_units,
            manager.inner.lock().free.len()
        );
        Ok(manager)
    }

    /// Blocks read and written since the file was opened.
    pub fn io_counts(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
        )
    }

    pub fn free_extents(&self) -> Vec<BlockAddr> {
        self.inner.lock().free.clone()
    }

    fn load_free_list(&self) -> StorageResult<()> {
        let free_block = self.inner.lock().desc.free;
        if !free_block.is_valid() {
            return Ok(());
        }

        let image = self.read(free_block)?;
        let header = page::check_image(&image, free_block.size)?;
        if header.page_type != PageType::Freelist {
            return Err(StorageError::corruption(format!(
                "free list block {free_block} is a {} page",
                header.page_type
            )));
        }
        let body = page::image_body(&image, &header);
        if body.len() != header.entries as usize * 8 {
            return Err(StorageError::corruption("free list length mismatch"));
        }

        {
            let mut inner = self.inner.lock();
            inner.free.clear();
            inner.desc.free = BlockAddr::INVALID;
        }
        for entry in body.chunks_exact(8) {
            self.free(BlockAddr::new(
                LittleEndian::read_u32(&entry[0..4]),
                LittleEndian::read_u32(&entry[4..8]),
            ))?;
        }
        // The free list's own block is reusable once it has been read.
        self.free(free_block)
    }

    /// Persist the free list and description record.
    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();

        let previous = inner.desc.free;
        if previous.is_valid() {
            Self::release(&mut inner, self.allocation_size, previous)?;
        }

        let mut buf = page::new_image(inner.free.len() * 8);
        for extent in &inner.free {
            buf.put_u32_le(extent.addr);
            buf.put_u32_le(extent.size);
        }
        let mut header = PageHeader::new(PageType::Freelist);
        header.entries = inner.free.len() as u32;
        let image = page::finish_image(buf, header, self.allocation_size);

        // Appended past the end so writing it does not change the list it records.
        let units = image.len() as u32 / self.allocation_size;
        let block = BlockAddr::new(inner.file_units, image.len() as u32);
        inner.file_units += units;
        Self::write_block(&mut inner.file, self.allocation_size, block, &image)?;

        inner.desc.free = block;
        let desc = inner.desc.encode()?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&desc)?;
        inner.file.sync_all()?;
        debug!(
            "closed block file: {} free extents written to {}",
            header.entries, block
        );
        Ok(())
    }

    fn write_block(
        file: &mut File,
        allocation_size: u32,
        block: BlockAddr,
        image: &[u8],
    ) -> StorageResult<()> {
        file.seek(SeekFrom::Start(block.file_offset(allocation_size)))?;
        file.write_all(image)?;
        Ok(())
    }

    fn check_block(&self, inner: &BlockFile, block: BlockAddr) -> StorageResult<()> {
        if !block.is_valid() || block.size == 0 || block.size % self.allocation_size != 0 {
            return Err(invalid_input(format!("invalid block address {block}")));
        }
        let end = block.addr as u64 + (block.size / self.allocation_size) as u64;
        if end > inner.file_units as u64 {
            return Err(StorageError::corruption(format!(
                "block {block} extends past the end of the file ({} units)",
                inner.file_units
            )));
        }
        Ok(())
    }

    fn release(inner: &mut BlockFile, allocation_size: u32, block: BlockAddr) -> StorageResult<()> {
        let units = block.size / allocation_size;
        let pos = inner.free.partition_point(|e| e.addr < block.addr);

        if let Some(prev) = pos.checked_sub(1).map(|i| inner.free[i]) {
            if prev.addr + prev.size / allocation_size > block.addr {
                return Err(StorageError::corruption(format!(
                    "block {block} freed twice (overlaps free extent {prev})"
                )));
            }
        }
        if let Some(next) = inner.free.get(pos).copied() {
            if block.addr + units > next.addr {
                return Err(StorageError::corruption(format!(
                    "block {block} freed twice (overlaps free extent {next})"
                )));
            }
        }

        inner.free.insert(pos, block);

        // Coalesce with the following extent, then the preceding one.
        if pos + 1 < inner.free.len() {
            let next = inner.free[pos + 1];
            if block.addr + units == next.addr {
                inner.free[pos].size += next.size;
                inner.free.remove(pos + 1);
            }
        }
        if pos > 0 {
            let prev = inner.free[pos - 1];
            if prev.addr + prev.size / allocation_size == inner.free[pos].addr {
                inner.free[pos - 1].size += inner.free[pos].size;
                inner.free.remove(pos);
            }
        }
        Ok(())
    }

    fn allocate(&self, inner: &mut BlockFile, size: u32) -> BlockAddr {
        let units = size / self.allocation_size;
        if let Some(i) = inner.free.iter().position(|e| e.size >= size) {
            let extent = inner.free[i];
            if extent.size == size {
                inner.free.remove(i);
            } else {
                inner.free[i] = BlockAddr::new(extent.addr + units, extent.size - size);
            }
            return BlockAddr::new(extent.addr, size);
        }

        let block = BlockAddr::new(inner.file_units, size);
        inner.file_units += units;
        block
    }
}

impl BlockStore for FileBlockManager {
    fn allocation_size(&self) -> u32 {
        self.allocation_size
    }

    fn read(&self, addr: BlockAddr) -> StorageResult<Bytes> {
        let mut inner = self.inner.lock();
        self.check_block(&inner, addr)?;

        let mut buf = vec![0u8; addr.size as usize];
        inner
            .file
            .seek(SeekFrom::Start(addr.file_offset(self.allocation_size)))?;
        inner.file.read_exact(&mut buf)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(Bytes::from(buf))
    }

    fn write(&self, image: &[u8]) -> StorageResult<BlockAddr> {
        if image.is_empty() || image.len() % self.allocation_size as usize != 0 {
            return Err(invalid_input(format!(
                "image of {} bytes is not a multiple of the allocation size {}",
                image.len(),
                self.allocation_size
            )));
        }
        let mut inner = self.inner.lock();
        let block = self.allocate(&mut inner, image.len() as u32);
        if let Err(e) = Self::write_block(&mut inner.file, self.allocation_size, block, image) {
            Self::release(&mut inner, self.allocation_size, block)?;
            return Err(e);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    fn write_at(&self, addr: BlockAddr, image: &[u8]) -> StorageResult<()> {
        if image.len() != addr.size as usize {
            return Err(invalid_input(format!(
                "image of {} bytes does not match block {addr}",
                image.len()
            )));
        }
        let mut inner = self.inner.lock();
        self.check_block(&inner, addr)?;
        Self::write_block(&mut inner.file, self.allocation_size, addr, image)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn free(&self, addr: BlockAddr) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        self.check_block(&inner, addr)?;
        Self::release(&mut inner, self.allocation_size, addr)
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }

    fn load_meta(&self) -> StorageResult<Option<TreeMeta>> {
        let inner = self.inner.lock();
        Ok(inner.desc.config.clone().map(|config| TreeMeta {
            root: inner.desc.root,
            lsn: inner.desc.lsn,
            config,
        }))
    }

    fn store_meta(&self, meta: &TreeMeta) -> StorageResult<()> {
        if meta.config.allocation_size != self.allocation_size {
            return Err(StorageError::InvalidConfig(format!(
                "tree allocation size {} does not match the file's {}",
                meta.config.allocation_size, self.allocation_size
            )));
        }
        let mut inner = self.inner.lock();
        inner.desc.root = meta.root;
        inner.desc.lsn = meta.lsn;
        inner.desc.config = Some(meta.config.clone());
        let desc = inner.desc.encode()?;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&desc)?;
        Ok(())
    }
}
