pub mod evict;
pub mod hazard;
pub mod read;
pub mod request;
pub mod stats;

pub use evict::EvictKind;
pub use hazard::PageHandle;
pub use stats::CacheStats;

use crate::btree::{BTree, TreeId};
use crate::config::ConnectionConfig;
use crate::storage::error::{StorageError, StorageResult};
use dashmap::DashMap;
use evict::EvictRequest;
use hazard::HazardTable;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use read::ReadRequest;
use request::{Completion, RequestTable};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long an idle server sleeps before re-checking for shutdown.
pub(crate) const SERVER_TICK: Duration = Duration::from_millis(100);

/// A wake-up flag servers sleep on.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn wake(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Sleep until woken or `timeout` passes; true if woken.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut *pending)
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub pages_in: AtomicU64,
    pub pages_out: AtomicU64,
    pub evict_clean: AtomicU64,
    pub evict_dirty: AtomicU64,
    pub evict_split: AtomicU64,
    pub evict_hazard_blocked: AtomicU64,
    pub evict_slow: AtomicU64,
    pub read_lockouts: AtomicU64,
    /// Tree counters carried over from closed trees.
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub overflow_reads: AtomicU64,
    pub overflow_writes: AtomicU64,
    pub splits: AtomicU64,
}

/// The connection's page cache: resident-page accounting, hazard
/// references, and the request tables of the read and eviction servers.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

pub(crate) struct CacheInner {
    config: ConnectionConfig,
    hazard: HazardTable,
    read_requests: RequestTable<ReadRequest>,
    evict_requests: RequestTable<EvictRequest>,
    read_signal: Signal,
    evict_signal: Signal,
    trees: DashMap<TreeId, Arc<BTree>>,
    /// Serializes page eviction and reconciliation.
    evict_lock: Mutex<()>,
    read_gen: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    read_lockout: AtomicBool,
    read_force: AtomicBool,
    running: AtomicBool,
    sessions: Mutex<Vec<bool>>,
    counters: CacheCounters,
}

impl Cache {
    pub fn new(config: ConnectionConfig) -> StorageResult<Self> {
        config.validate()?;
        info!(
            "cache: {} bytes, {} sessions x {} hazard references",
            config.cache_size, config.session_max, config.hazard_max
        );
        Ok(Self {
            inner: Arc::new(CacheInner {
                hazard: HazardTable::new(config.session_max, config.hazard_max),
                read_requests: RequestTable::new("read", config.read_request_slots),
                evict_requests: RequestTable::new("evict", config.evict_request_slots),
                read_signal: Signal::default(),
                evict_signal: Signal::default(),
                trees: DashMap::new(),
                evict_lock: Mutex::new(()),
                read_gen: AtomicU64::new(1),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                read_lockout: AtomicBool::new(false),
                read_force: AtomicBool::new(false),
                running: AtomicBool::new(false),
                sessions: Mutex::new(vec![false; config.session_max]),
                counters: CacheCounters::default(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub(crate) fn hazard(&self) -> &HazardTable {
        &self.inner.hazard
    }

    pub fn bytes_in_use(&self) -> u64 {
        let bytes_in = self.inner.bytes_in.load(Ordering::Acquire);
        let bytes_out = self.inner.bytes_out.load(Ordering::Acquire);
        bytes_in.saturating_sub(bytes_out)
    }

    pub(crate) fn next_read_gen(&self) -> u64 {
        self.inner.read_gen.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn account_in(&self, bytes: usize) {
        self.inner.bytes_in.fetch_add(bytes as u64, Ordering::AcqRel);
        self.inner.counters.pages_in.fetch_add(1, Ordering::Relaxed);
        self.check_pressure();
    }

    pub(crate) fn account_out(&self, bytes: usize) {
        self.inner.bytes_out.fetch_add(bytes as u64, Ordering::AcqRel);
        self.inner.counters.pages_out.fetch_add(1, Ordering::Relaxed);
        self.update_lockout();
    }

    /// Memory added to a resident page by an update or insert.
    pub(crate) fn account_modify(&self, bytes: usize) {
        self.inner.bytes_in.fetch_add(bytes as u64, Ordering::AcqRel);
        self.check_pressure();
    }

    fn check_pressure(&self) {
        let config = &self.inner.config;
        let in_use = self.bytes_in_use();
        if in_use > config.bytes_at_pct(config.read_lockout_pct)
            && !self.inner.read_lockout.swap(true, Ordering::AcqRel)
        {
            self.inner.counters.read_lockouts.fetch_add(1, Ordering::Relaxed);
            info!("cache: read lockout at {} bytes in use", in_use);
        }
        if in_use > config.bytes_at_pct(config.evict_trigger_pct) {
            self.inner.evict_signal.wake();
        }
    }

    /// Clear the read lockout once usage is back under the low-water mark.
    pub(crate) fn update_lockout(&self) {
        let config = &self.inner.config;
        if self.inner.read_lockout.load(Ordering::Acquire)
            && self.bytes_in_use() < config.bytes_at_pct(config.read_lockout_clear_pct)
            && self.inner.read_lockout.swap(false, Ordering::AcqRel)
        {
            debug!("cache: read lockout cleared");
            self.inner.read_signal.wake();
        }
    }

    pub fn is_read_locked_out(&self) -> bool {
        self.inner.read_lockout.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::SeqCst);
        self.inner.read_signal.wake();
        self.inner.evict_signal.wake();
    }

    /// Queue `request` for a server and wait for its result. A request
    /// still queued after the cache stops is taken back and fails with
    /// `Closed`.
    pub(crate) fn submit_and_wait<T>(
        &self,
        table: &RequestTable<T>,
        signal: &Signal,
        session: u32,
        request: T,
        done: &Completion,
    ) -> StorageResult<()> {
        if !self.is_running() {
            return Err(StorageError::Closed);
        }
        let ticket = table.submit(session, request)?;
        signal.wake();
        loop {
            if let Some(result) = done.wait_for(SERVER_TICK) {
                return result;
            }
            // Once the server has taken the request it always completes it.
            if !self.is_running() && table.withdraw(ticket) {
                return Err(StorageError::Closed);
            }
        }
    }

    pub(crate) fn register_tree(&self, tree: Arc<BTree>) {
        self.inner.trees.insert(tree.id(), tree);
    }

    pub(crate) fn unregister_tree(&self, id: TreeId) {
        if let Some((_, tree)) = self.inner.trees.remove(&id) {
            let counters = &self.inner.counters;
            let stats = &tree.stats;
            counters
                .pages_read
                .fetch_add(stats.pages_read.load(Ordering::Relaxed), Ordering::Relaxed);
            counters
                .pages_written
                .fetch_add(stats.pages_written.load(Ordering::Relaxed), Ordering::Relaxed);
            counters
                .overflow_reads
                .fetch_add(stats.overflow_reads.load(Ordering::Relaxed), Ordering::Relaxed);
            counters
                .overflow_writes
                .fetch_add(stats.overflow_writes.load(Ordering::Relaxed), Ordering::Relaxed);
            counters
                .splits
                .fetch_add(stats.splits.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    pub(crate) fn trees(&self) -> Vec<Arc<BTree>> {
        self.inner.trees.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn claim_session(&self) -> StorageResult<u32> {
        let mut sessions = self.inner.sessions.lock();
        let slot = sessions
            .iter()
            .position(|used| !used)
            .ok_or(StorageError::SessionLimit {
                max: self.inner.config.session_max,
            })?;
        sessions[slot] = true;
        Ok(slot as u32 + 1)
    }

    pub(crate) fn release_session(&self, id: u32) {
        if let Some(used) = self.inner.sessions.lock().get_mut(id as usize - 1) {
            *used = false;
        }
    }
}
