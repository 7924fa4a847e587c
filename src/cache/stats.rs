use super::Cache;
use std::fmt;
use std::sync::atomic::Ordering;

/// A point-in-time snapshot of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub pages_in: u64,
    pub pages_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bytes_in_use: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub evict_clean: u64,
    pub evict_dirty: u64,
    pub evict_split: u64,
    pub evict_hazard_blocked: u64,
    pub evict_slow: u64,
    pub read_lockouts: u64,
    pub overflow_reads: u64,
    pub overflow_writes: u64,
    /// Reconciliations that produced more than one page.
    pub splits: u64,
}

impl Cache {
    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let c = &inner.counters;
        let mut stats = CacheStats {
            pages_in: c.pages_in.load(Ordering::Relaxed),
            pages_out: c.pages_out.load(Ordering::Relaxed),
            bytes_in: inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: inner.bytes_out.load(Ordering::Relaxed),
            bytes_in_use: self.bytes_in_use(),
            pages_read: c.pages_read.load(Ordering::Relaxed),
            pages_written: c.pages_written.load(Ordering::Relaxed),
            evict_clean: c.evict_clean.load(Ordering::Relaxed),
            evict_dirty: c.evict_dirty.load(Ordering::Relaxed),
            evict_split: c.evict_split.load(Ordering::Relaxed),
            evict_hazard_blocked: c.evict_hazard_blocked.load(Ordering::Relaxed),
            evict_slow: c.evict_slow.load(Ordering::Relaxed),
            read_lockouts: c.read_lockouts.load(Ordering::Relaxed),
            overflow_reads: c.overflow_reads.load(Ordering::Relaxed),
            overflow_writes: c.overflow_writes.load(Ordering::Relaxed),
            splits: c.splits.load(Ordering::Relaxed),
        };
        for tree in self.trees() {
            stats.pages_read += tree.stats.pages_read.load(Ordering::Relaxed);
            stats.pages_written += tree.stats.pages_written.load(Ordering::Relaxed);
            stats.overflow_reads += tree.stats.overflow_reads.load(Ordering::Relaxed);
            stats.overflow_writes += tree.stats.overflow_writes.load(Ordering::Relaxed);
            stats.splits += tree.stats.splits.load(Ordering::Relaxed);
        }
        stats
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cache: bytes in use: {}", self.bytes_in_use)?;
        writeln!(f, "cache: pages in/out: {}/{}", self.pages_in, self.pages_out)?;
        writeln!(f, "cache: pages read/written: {}/{}", self.pages_read, self.pages_written)?;
        writeln!(
            f,
            "cache: evicted clean/dirty/split: {}/{}/{}",
            self.evict_clean, self.evict_dirty, self.evict_split
        )?;
        writeln!(f, "cache: evictions blocked by hazard references: {}", self.evict_hazard_blocked)?;
        writeln!(f, "cache: slow eviction passes: {}", self.evict_slow)?;
        writeln!(f, "cache: read lockouts: {}", self.read_lockouts)?;
        writeln!(
            f,
            "cache: overflow reads/writes: {}/{}",
            self.overflow_reads, self.overflow_writes
        )?;
        write!(f, "cache: page splits: {}", self.splits)
    }
}
