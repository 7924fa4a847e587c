//! Bringing pages into the cache.
//!
//! Sessions never read blocks themselves: a page that is not resident is
//! requested from the read server, which holds back while the cache is over
//! its read lockout threshold. Once a page is resident a session acquires it
//! by publishing a hazard reference and re-checking the page reference.

use super::hazard::PageHandle;
use super::request::Completion;
use super::{Cache, SERVER_TICK};
use crate::btree::inmem::page_from_image;
use crate::btree::page::Page;
use crate::btree::reference::{PageRef, RefState};
use crate::btree::BTree;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::check_image;
use crate::storage::page::verify::verify_image;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;

pub(crate) struct ReadRequest {
    tree: Arc<BTree>,
    pref: Arc<PageRef>,
    parent: Weak<Page>,
    done: Arc<Completion>,
}

impl Cache {
    /// Make the page `pref` references resident and acquire it for `session`.
    pub(crate) fn page_in(
        &self,
        session: u32,
        tree: &Arc<BTree>,
        pref: &Arc<PageRef>,
        parent: &Weak<Page>,
    ) -> StorageResult<PageHandle> {
        loop {
            match pref.state() {
                RefState::Disk => {
                    let done = Completion::new();
                    let request = ReadRequest {
                        tree: Arc::clone(tree),
                        pref: Arc::clone(pref),
                        parent: parent.clone(),
                        done: Arc::clone(&done),
                    };
                    let inner = &self.inner;
                    self.submit_and_wait(
                        &inner.read_requests,
                        &inner.read_signal,
                        session,
                        request,
                        &done,
                    )?;
                }
                RefState::Reading | RefState::Locked => thread::yield_now(),
                RefState::Mem => {
                    if let Some(handle) = self.try_acquire(session, pref)? {
                        return Ok(handle);
                    }
                    thread::yield_now();
                }
            }
        }
    }

    /// Publish a hazard reference for a resident page, then confirm the
    /// page was not locked for eviction in the meantime.
    fn try_acquire(&self, session: u32, pref: &PageRef) -> StorageResult<Option<PageHandle>> {
        let Some(page) = pref.page() else {
            return Ok(None);
        };
        let slot = self.hazard().set(session, page.id())?;
        if pref.state_seqcst() == RefState::Mem
            && pref.page_id() == Some(page.id())
            && !page.is_discarded()
        {
            page.set_read_gen(self.next_read_gen());
            return Ok(Some(PageHandle::new(self.clone(), slot, page)));
        }
        self.hazard().clear(slot);
        Ok(None)
    }

    /// Read a page on the calling thread, bypassing the read server.
    pub(crate) fn read_now(
        &self,
        tree: &Arc<BTree>,
        pref: &Arc<PageRef>,
        parent: Weak<Page>,
    ) -> StorageResult<()> {
        self.read_page(tree, pref, parent)
    }

    fn read_page(
        &self,
        tree: &Arc<BTree>,
        pref: &Arc<PageRef>,
        parent: Weak<Page>,
    ) -> StorageResult<()> {
        // Someone else already read it, or is reading it.
        if !pref.try_begin_read() {
            return Ok(());
        }
        match self.load_page(tree, pref, parent) {
            Ok(page) => {
                let bytes = page.footprint();
                debug!(
                    "{}: read {} page {:?} from {}",
                    tree.name(),
                    page.page_type(),
                    page.id(),
                    pref.addr()
                );
                pref.finish_read(Arc::new(page));
                tree.stats.pages_read.fetch_add(1, Ordering::Relaxed);
                self.account_in(bytes);
                Ok(())
            }
            Err(e) => {
                pref.abort_read();
                warn!("{}: read of block {} failed: {}", tree.name(), pref.addr(), e);
                Err(e)
            }
        }
    }

    fn load_page(
        &self,
        tree: &BTree,
        pref: &Arc<PageRef>,
        parent: Weak<Page>,
    ) -> StorageResult<Page> {
        let addr = pref.addr();
        if !addr.is_valid() {
            return Err(StorageError::corruption(
                "reference to an unwritten page has no resident page",
            ));
        }
        let image = tree.store().read(addr)?;
        check_image(&image, addr.size)?;
        if tree.config().verify_on_read {
            verify_image(&image, addr, tree.config())?;
        }
        page_from_image(tree, image, addr, parent, pref, self.next_read_gen())
    }
}

/// The read server: serves read requests until the cache stops running.
pub(crate) fn read_server(cache: Cache) {
    info!("read server started");
    let inner = &cache.inner;
    while cache.is_running() {
        if inner.read_requests.in_use() == 0 {
            inner.read_signal.wait(SERVER_TICK);
            continue;
        }
        if cache.is_read_locked_out() && !inner.read_force.swap(false, Ordering::AcqRel) {
            inner.evict_signal.wake();
            inner.read_signal.wait(SERVER_TICK);
            continue;
        }
        let pending = inner.read_requests.take_pending();
        if pending.is_empty() {
            thread::yield_now();
        }
        for (slot, req) in pending {
            let result = cache.read_page(&req.tree, &req.pref, req.parent);
            inner.read_requests.release(slot);
            req.done.complete(result);
        }
    }

    for (slot, req) in inner.read_requests.take_pending() {
        inner.read_requests.release(slot);
        req.done.complete(Err(StorageError::Closed));
    }
    info!("read server stopped");
}
