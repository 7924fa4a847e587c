//! The connection: a cache, its server threads and the open trees.

use crate::btree::page::Page;
use crate::btree::{BTree, TreeId, TreeOptions};
use crate::cache::evict::evict_server;
use crate::cache::read::read_server;
use crate::cache::{Cache, CacheStats, EvictKind};
use crate::config::ConnectionConfig;
use crate::session::Session;
use crate::storage::disk::BlockStore;
use crate::storage::error::{StorageError, StorageResult};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct Connection {
    cache: Cache,
    servers: Mutex<Vec<JoinHandle<()>>>,
    next_tree: AtomicU32,
}

impl Connection {
    /// Create the cache and start the read and eviction servers.
    pub fn open(config: ConnectionConfig) -> StorageResult<Self> {
        let cache = Cache::new(config)?;
        cache.set_running(true);

        let mut servers = Vec::with_capacity(2);
        for (name, server) in [
            ("read-server", read_server as fn(Cache)),
            ("evict-server", evict_server as fn(Cache)),
        ] {
            let cache = cache.clone();
            let handle = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || server(cache))?;
            servers.push(handle);
        }
        info!("connection opened");
        Ok(Self {
            cache,
            servers: Mutex::new(servers),
            next_tree: AtomicU32::new(1),
        })
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn open_session(&self) -> StorageResult<Session> {
        if !self.cache.is_running() {
            return Err(StorageError::Closed);
        }
        Session::new(self.cache.clone())
    }

    /// Open the tree held by `store`, creating an empty one if the store has
    /// no tree yet.
    pub fn open_tree(
        &self,
        name: &str,
        store: Arc<dyn BlockStore>,
        options: TreeOptions,
    ) -> StorageResult<Arc<BTree>> {
        if !self.cache.is_running() {
            return Err(StorageError::Closed);
        }
        let id = TreeId(self.next_tree.fetch_add(1, Ordering::Relaxed));
        let tree = BTree::open(&self.cache, id, name, store, options)?;
        self.cache.register_tree(Arc::clone(&tree));
        Ok(tree)
    }

    /// Write every dirty page of `tree` and its metadata.
    pub fn sync_tree(&self, session: &Session, tree: &Arc<BTree>) -> StorageResult<()> {
        self.cache.evict_request(session.id(), tree, EvictKind::Sync)
    }

    /// Write and evict every page of `tree`, then forget it.
    pub fn close_tree(&self, session: &Session, tree: &Arc<BTree>) -> StorageResult<()> {
        self.cache.evict_request(session.id(), tree, EvictKind::Close)?;
        self.cache.unregister_tree(tree.id());
        info!("{}: closed", tree.name());
        Ok(())
    }

    /// Ask the eviction server to evict one page.
    pub fn evict_page(
        &self,
        session: &Session,
        tree: &Arc<BTree>,
        page: &Arc<Page>,
    ) -> StorageResult<()> {
        self.cache
            .evict_request(session.id(), tree, EvictKind::Page(Arc::clone(page)))
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Close every open tree and stop the servers.
    pub fn close(&self) -> StorageResult<()> {
        if !self.cache.is_running() {
            return Ok(());
        }
        let mut result = Ok(());
        match self.open_session() {
            Ok(session) => {
                for tree in self.cache.trees() {
                    if let Err(e) = self.close_tree(&session, &tree) {
                        warn!("{}: close failed: {}", tree.name(), e);
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
            }
            Err(e) => result = Err(e),
        }

        self.cache.set_running(false);
        for handle in self.servers.lock().drain(..) {
            if handle.join().is_err() {
                error!("server thread panicked");
            }
        }
        info!("connection closed\n{}", self.cache.stats());
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("connection close failed: {}", e);
        }
    }
}
