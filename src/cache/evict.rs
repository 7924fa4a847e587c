//! Page eviction.
//!
//! The eviction server does two jobs. It serves explicit requests from
//! sessions: sync or close a tree, or evict one page. And whenever the cache
//! is over its trigger threshold it sweeps the open trees for the least
//! recently used resident pages, reconciles them and drops them.
//!
//! Evicting a page takes its reference from `Mem` to `Locked`, then checks
//! the hazard table. Any hazard reference on the page puts it back to `Mem`
//! and the attempt fails with `Busy`; the caller tries again later. All
//! eviction and reconciliation runs under the cache's eviction lock, so at
//! most one thread restructures pages at a time.

use super::request::Completion;
use super::{Cache, SERVER_TICK};
use crate::btree::page::Page;
use crate::btree::reconcile::{reconcile, RecOptions, RecOutcome};
use crate::btree::reference::{PageRef, RefState};
use crate::btree::{walk, BTree};
use crate::storage::disk::BlockAddr;
use crate::storage::error::{StorageError, StorageResult};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

/// Sweeps in a row that may free nothing before the server gives up.
const EVICT_STALL_MAX: u32 = 10;
/// Passes a forced eviction makes over a tree before reporting it busy.
const FORCED_PASS_MAX: u32 = 64;

/// What an eviction request asks for.
#[derive(Debug, Clone)]
pub enum EvictKind {
    /// Write every dirty page, leaving pages resident.
    Sync,
    /// Write and evict every page of the tree.
    Close,
    /// Evict one page.
    Page(Arc<Page>),
}

pub(crate) struct EvictRequest {
    tree: Arc<BTree>,
    kind: EvictKind,
    done: Arc<Completion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecMode {
    /// Write the page if needed and drop it from the cache.
    Evict,
    /// Write the page if needed and keep it resident.
    Sync,
}

/// Exclusive access to a root reference, held across a bulk load's final
/// reconciliation.
struct RootLock {
    pref: Arc<PageRef>,
    page: Option<Arc<Page>>,
}

impl Cache {
    /// Hand a request to the eviction server and wait for its result.
    pub(crate) fn evict_request(
        &self,
        session: u32,
        tree: &Arc<BTree>,
        kind: EvictKind,
    ) -> StorageResult<()> {
        let done = Completion::new();
        let request = EvictRequest {
            tree: Arc::clone(tree),
            kind,
            done: Arc::clone(&done),
        };
        let inner = &self.inner;
        self.submit_and_wait(
            &inner.evict_requests,
            &inner.evict_signal,
            session,
            request,
            &done,
        )
    }

    /// Evict one page on the calling thread.
    pub fn evict_page_now(&self, tree: &Arc<BTree>, page: &Arc<Page>) -> StorageResult<()> {
        self.evict_with(tree, page, RecOptions::default())
    }

    pub(crate) fn evict_with(
        &self,
        tree: &Arc<BTree>,
        page: &Arc<Page>,
        options: RecOptions,
    ) -> StorageResult<()> {
        let _guard = self.inner.evict_lock.lock();
        self.evict_one(tree, page, RecMode::Evict, options)
    }

    fn serve(&self, req: &EvictRequest) -> StorageResult<()> {
        debug!("{}: eviction request {:?}", req.tree.name(), req.kind);
        match &req.kind {
            EvictKind::Sync => self.forced(&req.tree, RecMode::Sync),
            EvictKind::Close => self.forced(&req.tree, RecMode::Evict),
            EvictKind::Page(page) => self.evict_with(&req.tree, page, RecOptions::default()),
        }
    }

    /// Reconcile `page` and, in evict mode, drop it from the cache.
    ///
    /// The caller holds the eviction lock.
    fn evict_one(
        &self,
        tree: &Arc<BTree>,
        page: &Arc<Page>,
        mode: RecMode,
        options: RecOptions,
    ) -> StorageResult<()> {
        if page.is_discarded() {
            return Ok(());
        }
        let Some(pref) = page.parent_ref() else {
            return Ok(());
        };
        self.lock_page(&pref, page)?;
        if mode == RecMode::Evict && page.has_resident_children() {
            pref.unlock();
            return Err(StorageError::busy(format!(
                "page {:?} has resident children",
                page.id()
            )));
        }
        let root = if options.promote_to_root {
            match self.lock_root(tree) {
                Ok(root) => Some(root),
                Err(e) => {
                    pref.unlock();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let outcome = match reconcile(tree, page, &pref, options) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(root) = root {
                    root.pref.unlock();
                }
                pref.unlock();
                return Err(e);
            }
        };

        let counters = &self.inner.counters;
        match outcome {
            RecOutcome::Split(split) => {
                pref.set_addr(BlockAddr::INVALID);
                mark_parent_dirty(page);
                self.account_in(split.footprint());
                match root {
                    Some(root) => self.promote(tree, root, &pref, page, split),
                    None => {
                        if page.is_pinned() {
                            split.set_pinned(true);
                        }
                        pref.replace(split);
                        self.discard(page);
                    }
                }
                counters.evict_split.fetch_add(1, Ordering::Relaxed);
            }
            outcome => {
                if let Some(root) = root {
                    root.pref.unlock();
                }
                let written = match outcome {
                    RecOutcome::Written(addr) => {
                        if pref.addr() != addr {
                            pref.set_addr(addr);
                            mark_parent_dirty(page);
                        }
                        true
                    }
                    _ => false,
                };
                match mode {
                    RecMode::Evict => {
                        pref.evict();
                        self.discard(page);
                        let counter = if written {
                            &counters.evict_dirty
                        } else {
                            &counters.evict_clean
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    RecMode::Sync => pref.unlock(),
                }
            }
        }
        Ok(())
    }

    /// Take exclusive access to a resident page: lock its reference, then
    /// make sure no session holds a hazard reference to it.
    fn lock_page(&self, pref: &PageRef, page: &Page) -> StorageResult<()> {
        if !pref.try_lock(page.id()) {
            return Err(StorageError::busy(format!(
                "page {:?} is not resident or is being read",
                page.id()
            )));
        }
        if self.hazard().is_held(page.id()) {
            pref.unlock();
            self.inner
                .counters
                .evict_hazard_blocked
                .fetch_add(1, Ordering::Relaxed);
            debug!("page {:?} eviction blocked by a hazard reference", page.id());
            return Err(StorageError::busy(format!(
                "page {:?} is in use",
                page.id()
            )));
        }
        Ok(())
    }

    fn lock_root(&self, tree: &BTree) -> StorageResult<RootLock> {
        let pref = Arc::clone(tree.root());
        let page = pref.page();
        if let Some(root) = &page {
            self.lock_page(&pref, root)?;
        } else if pref.state() != RefState::Disk {
            return Err(StorageError::busy("root page is being read"));
        }
        Ok(RootLock { pref, page })
    }

    /// Install the internal page of a bulk load's split as the tree root.
    fn promote(
        &self,
        tree: &BTree,
        root: RootLock,
        pref: &PageRef,
        page: &Page,
        split: Arc<Page>,
    ) {
        let old = root.pref.addr();
        split.set_pinned(true);
        root.pref.set_addr(BlockAddr::INVALID);
        root.pref.replace(split);
        if let Some(old_root) = root.page {
            self.discard(&old_root);
        }
        if old.is_valid() {
            if let Err(e) = tree.store().free(old) {
                warn!("{}: failed to free block {}: {}", tree.name(), old, e);
            }
        }
        pref.evict();
        self.discard(page);
        info!("{}: new root installed", tree.name());
    }

    fn discard(&self, page: &Page) {
        page.set_discarded();
        self.account_out(page.footprint());
    }

    /// Sync or close a whole tree: visit its resident pages children first,
    /// retrying the pages that were busy.
    fn forced(&self, tree: &Arc<BTree>, mode: RecMode) -> StorageResult<()> {
        let config = &self.inner.config;
        let mut round = 0;
        let mut passes = 0;
        loop {
            let mut progress = false;
            let mut blocked = None;
            {
                let _guard = self.inner.evict_lock.lock();
                for page in walk::resident_pages(tree) {
                    if mode == RecMode::Sync && !page.needs_write() {
                        continue;
                    }
                    match self.evict_one(tree, &page, mode, RecOptions::default()) {
                        Ok(()) => progress = true,
                        Err(e) if e.is_retryable() => blocked = Some(e),
                        Err(e) => return Err(e),
                    }
                }
            }
            if self.forced_done(tree, mode) {
                break;
            }

            passes += 1;
            if !progress {
                round += 1;
            }
            if round > config.evict_retry_max || passes >= FORCED_PASS_MAX {
                warn!("{}: {:?} gave up after {} passes", tree.name(), mode, passes);
                return Err(blocked.unwrap_or_else(|| {
                    StorageError::busy(format!("{} still has pages to write", tree.name()))
                }));
            }
            if !progress {
                debug!(
                    "{}: {:?} retry round {} of {}",
                    tree.name(),
                    mode,
                    round,
                    config.evict_retry_max
                );
                thread::sleep(config.evict_retry_backoff * round);
            }
        }
        tree.write_meta()?;
        info!("{}: {:?} complete, root {}", tree.name(), mode, tree.root().addr());
        Ok(())
    }

    fn forced_done(&self, tree: &BTree, mode: RecMode) -> bool {
        match mode {
            RecMode::Evict => tree.root().state() == RefState::Disk,
            RecMode::Sync => {
                let _guard = self.inner.evict_lock.lock();
                walk::resident_pages(tree).iter().all(|p| !p.needs_write())
            }
        }
    }

    /// Least recently used pages from every tree that allows eviction.
    fn evict_candidates(&self) -> Vec<(Arc<BTree>, Arc<Page>)> {
        let config = &self.inner.config;
        let mut candidates = Vec::new();
        for tree in self.trees() {
            if candidates.len() >= config.evict_walk_base {
                break;
            }
            if tree.is_no_eviction() {
                continue;
            }
            let pages = walk::resident_pages(&tree);
            let mut last = tree.evict_walk_last.lock();
            let start = last
                .and_then(|id| pages.iter().position(|p| p.id() == id))
                .map_or(0, |i| i + 1);
            let mut taken = 0;
            for page in pages.iter().cycle().skip(start).take(pages.len()) {
                if taken >= config.evict_walk_per_tree {
                    break;
                }
                *last = Some(page.id());
                if page.is_pinned()
                    || page.is_discarded()
                    || page.is_bulk()
                    || page.has_resident_children()
                {
                    continue;
                }
                candidates.push((Arc::clone(&tree), Arc::clone(page)));
                taken += 1;
            }
        }

        order_candidates(&mut candidates, config.evict_group);
        candidates
    }

    /// Try to evict each candidate. A page that cannot be evicted now moves
    /// to the back of the line.
    ///
    /// The caller holds the eviction lock.
    fn evict_batch(&self, candidates: Vec<(Arc<BTree>, Arc<Page>)>) {
        for (tree, page) in candidates {
            if let Err(e) = self.evict_one(&tree, &page, RecMode::Evict, RecOptions::default()) {
                if !e.is_retryable() {
                    warn!("{}: eviction of page {:?} failed: {}", tree.name(), page.id(), e);
                }
                page.set_read_gen(self.next_read_gen());
            }
        }
    }

    /// Evict until usage is back under the target and reads are unblocked.
    fn evict_lru(&self) {
        let config = &self.inner.config;
        let target = config.bytes_at_pct(config.evict_target_pct);
        let mut stalled = 0;
        while self.is_running() && (self.bytes_in_use() > target || self.is_read_locked_out()) {
            let before = self.bytes_in_use();
            {
                let _guard = self.inner.evict_lock.lock();
                let candidates = self.evict_candidates();
                debug!("eviction walk found {} candidates", candidates.len());
                self.evict_batch(candidates);
            }
            self.update_lockout();

            if self.bytes_in_use() < before {
                stalled = 0;
                continue;
            }
            stalled += 1;
            if stalled >= EVICT_STALL_MAX {
                self.inner.counters.evict_slow.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "eviction is making no progress: {} bytes in use",
                    self.bytes_in_use()
                );
                if self.is_read_locked_out() {
                    self.inner.read_force.store(true, Ordering::Release);
                    self.inner.read_signal.wake();
                }
                return;
            }
            thread::yield_now();
        }
    }
}

/// Drop repeated pages, then keep the `group` least recently read.
fn order_candidates(candidates: &mut Vec<(Arc<BTree>, Arc<Page>)>, group: usize) {
    let mut seen = HashSet::new();
    candidates.retain(|(_, page)| seen.insert(page.id()));
    candidates.sort_by_key(|(_, page)| page.read_gen());
    candidates.truncate(group);
}

fn mark_parent_dirty(page: &Page) {
    if let Some(parent) = page.parent() {
        parent.modify().mark_dirty();
    }
}

/// The eviction server: serves eviction requests and keeps the cache under
/// its budget until the cache stops running.
pub(crate) fn evict_server(cache: Cache) {
    info!("eviction server started");
    let inner = &cache.inner;
    while cache.is_running() {
        if !inner.evict_signal.wait(SERVER_TICK) && inner.evict_requests.in_use() == 0 {
            cache.evict_lru();
            continue;
        }
        for (slot, req) in inner.evict_requests.take_pending() {
            let result = cache.serve(&req);
            if let Err(e) = &result {
                debug!("{}: eviction request failed: {}", req.tree.name(), e);
            }
            inner.evict_requests.release(slot);
            req.done.complete(result);
        }
        cache.evict_lru();
    }

    for (slot, req) in inner.evict_requests.take_pending() {
        inner.evict_requests.release(slot);
        req.done.complete(Err(StorageError::Closed));
    }
    info!("eviction server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::TreeOptions;
    use crate::config::{ConnectionConfig, TreeConfig};
    use crate::connection::Connection;
    use crate::session::Session;
    use crate::storage::disk::MemoryBlockStore;

    fn read_leaves(
        session: &Session,
        tree: &Arc<BTree>,
        page: &Arc<Page>,
        out: &mut Vec<Arc<Page>>,
    ) {
        if page.is_leaf() {
            out.push(Arc::clone(page));
            return;
        }
        for child in page.child_refs() {
            let handle = session.page_in(tree, child, &Arc::downgrade(page)).unwrap();
            read_leaves(session, tree, handle.page(), out);
        }
    }

    /// A synced row tree with several leaves, all of them resident.
    fn split_tree(conn: &Connection, session: &Session) -> (Arc<BTree>, Vec<Arc<Page>>) {
        let options = TreeOptions {
            config: TreeConfig {
                leaf_page_max: 4096,
                ..TreeConfig::row()
            },
            ..TreeOptions::default()
        };
        let store = Arc::new(MemoryBlockStore::new(512));
        let tree = conn.open_tree("lru", store, options).unwrap();
        for i in 0..1000 {
            let key = format!("key{i:06}");
            tree.put(session, key.as_bytes(), b"value").unwrap();
        }
        conn.sync_tree(session, &tree).unwrap();

        let root = tree.root().page().unwrap();
        let mut leaves = Vec::new();
        read_leaves(session, &tree, &root, &mut leaves);
        assert!(leaves.len() > 3, "only {} leaves", leaves.len());
        (tree, leaves)
    }

    #[test]
    fn test_candidates_are_leaves_in_read_order() {
        let conn = Connection::open(ConnectionConfig::default()).unwrap();
        let session = conn.open_session().unwrap();
        let (_tree, leaves) = split_tree(&conn, &session);
        let cache = conn.cache();

        // Newest reads on the leftmost leaves.
        for leaf in leaves.iter().rev() {
            leaf.set_read_gen(cache.next_read_gen());
        }
        let candidates = {
            let _guard = cache.inner.evict_lock.lock();
            cache.evict_candidates()
        };
        let ids: Vec<_> = candidates.iter().map(|(_, page)| page.id()).collect();
        let expected: Vec<_> = leaves.iter().rev().map(|page| page.id()).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_order_candidates_drops_repeats_and_keeps_oldest() {
        let conn = Connection::open(ConnectionConfig::default()).unwrap();
        let session = conn.open_session().unwrap();
        let (tree, leaves) = split_tree(&conn, &session);
        for (i, leaf) in leaves.iter().enumerate() {
            leaf.set_read_gen(100 - i as u64);
        }

        let mut candidates: Vec<_> = leaves
            .iter()
            .chain(leaves.iter().take(2))
            .map(|page| (Arc::clone(&tree), Arc::clone(page)))
            .collect();
        order_candidates(&mut candidates, usize::MAX);
        assert_eq!(candidates.len(), leaves.len());
        let gens: Vec<_> = candidates.iter().map(|(_, page)| page.read_gen()).collect();
        assert!(gens.windows(2).all(|pair| pair[0] < pair[1]));

        order_candidates(&mut candidates, 2);
        let ids: Vec<_> = candidates.iter().map(|(_, page)| page.id()).collect();
        let n = leaves.len();
        assert_eq!(ids, vec![leaves[n - 1].id(), leaves[n - 2].id()]);
    }

    #[test]
    fn test_busy_candidate_moves_to_the_back() {
        let conn = Connection::open(ConnectionConfig::default()).unwrap();
        let session = conn.open_session().unwrap();
        let (tree, leaves) = split_tree(&conn, &session);
        let cache = conn.cache();

        let held = session
            .page_in(&tree, &leaves[0].parent_ref().unwrap(), leaves[0].parent_weak())
            .unwrap();
        assert_eq!(held.id(), leaves[0].id());
        for leaf in &leaves {
            leaf.set_read_gen(cache.next_read_gen());
        }

        {
            let _guard = cache.inner.evict_lock.lock();
            let candidates = cache.evict_candidates();
            assert_eq!(candidates[0].1.id(), leaves[0].id());
            cache.evict_batch(candidates);
        }

        assert!(!leaves[0].is_discarded());
        for leaf in &leaves[1..] {
            assert!(leaf.is_discarded());
            assert!(leaves[0].read_gen() > leaf.read_gen());
        }
        assert!(cache.stats().evict_hazard_blocked >= 1);
        drop(held);
    }
}
