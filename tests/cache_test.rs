mod common;

use common::{connection, first_child, key, memory_tree, root_page, value};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use vibetree::btree::RefState;
use vibetree::{Connection, ConnectionConfig, StorageError, TreeConfig};

#[test]
fn test_hazard_reference_blocks_eviction() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    for i in 0..20 {
        tree.put(&session, &key(i), &value(i))?;
    }

    let search = tree.row_search(&session, &key(3))?;
    let leaf = Arc::clone(search.page.page());

    let err = conn.cache().evict_page_now(&tree, &leaf).unwrap_err();
    assert!(matches!(err, StorageError::Busy(_)));
    assert!(err.is_retryable());
    assert!(!leaf.is_discarded());
    assert!(conn.stats().evict_hazard_blocked >= 1);

    // The page is untouched while the reader still uses it.
    assert_eq!(tree.row_value(&search)?.as_deref(), Some(&value(3)[..]));
    drop(search);

    conn.cache().evict_page_now(&tree, &leaf)?;
    assert!(leaf.is_discarded());
    assert_eq!(first_child(&tree)?.state(), RefState::Disk);

    for i in 0..20 {
        assert_eq!(tree.get(&session, &key(i))?.as_ref(), &value(i)[..]);
    }
    Ok(())
}

#[test]
fn test_evict_page_request_goes_through_server() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    tree.put(&session, b"a", b"1")?;

    let leaf = first_child(&tree)?
        .page()
        .ok_or_else(|| anyhow::anyhow!("leaf is not resident"))?;
    conn.evict_page(&session, &tree, &leaf)?;
    assert!(leaf.is_discarded());

    let before = conn.stats().pages_read;
    assert_eq!(tree.get(&session, b"a")?.as_ref(), b"1");
    assert_eq!(conn.stats().pages_read, before + 1);
    assert_eq!(conn.stats().evict_dirty, 1);
    Ok(())
}

#[test]
fn test_read_error_leaves_reference_on_disk() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    tree.put(&session, b"k", b"v")?;

    let leaf_ref = first_child(&tree)?;
    let leaf = leaf_ref
        .page()
        .ok_or_else(|| anyhow::anyhow!("leaf is not resident"))?;
    conn.cache().evict_page_now(&tree, &leaf)?;
    assert_eq!(leaf_ref.state(), RefState::Disk);

    store.fail_reads(true);
    let err = tree.get(&session, b"k").unwrap_err();
    assert!(matches!(err, StorageError::Io(_)));
    assert_eq!(leaf_ref.state(), RefState::Disk);
    assert!(leaf_ref.page().is_none());
    assert_eq!(session.hazard_count(), 0);

    store.fail_reads(false);
    assert_eq!(tree.get(&session, b"k")?.as_ref(), b"v");
    assert_eq!(leaf_ref.state(), RefState::Mem);
    Ok(())
}

#[test]
fn test_corrupt_block_is_reported() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    tree.put(&session, b"k", b"v")?;

    let leaf_ref = first_child(&tree)?;
    let leaf = leaf_ref
        .page()
        .ok_or_else(|| anyhow::anyhow!("leaf is not resident"))?;
    conn.cache().evict_page_now(&tree, &leaf)?;

    store.corrupt(leaf_ref.addr(), 40);
    let err = tree.get(&session, b"k").unwrap_err();
    assert!(matches!(err, StorageError::Corruption(_)));
    assert!(!err.is_retryable());
    assert_eq!(leaf_ref.state(), RefState::Disk);
    Ok(())
}

#[test]
fn test_sessions_are_limited_and_reused() -> anyhow::Result<()> {
    common::init_logging();
    let conn = Connection::open(ConnectionConfig {
        session_max: 2,
        ..ConnectionConfig::default()
    })?;
    let a = conn.open_session()?;
    let b = conn.open_session()?;
    assert!(matches!(
        conn.open_session(),
        Err(StorageError::SessionLimit { max: 2 })
    ));
    let id = b.id();
    drop(b);
    let c = conn.open_session()?;
    assert_eq!(c.id(), id);
    assert_ne!(a.id(), c.id());
    Ok(())
}

#[test]
fn test_hazard_slots_run_out() -> anyhow::Result<()> {
    common::init_logging();
    let conn = Connection::open(ConnectionConfig {
        hazard_max: 2,
        ..ConnectionConfig::default()
    })?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;

    let root = session.page_in(&tree, tree.root(), &Weak::new())?;
    let leaf_ref = first_child(&tree)?;
    let leaf = session.page_in(&tree, &leaf_ref, &Arc::downgrade(root.page()))?;
    assert_eq!(session.hazard_count(), 2);
    assert!(matches!(
        session.page_in(&tree, &leaf_ref, &Arc::downgrade(root.page())),
        Err(StorageError::HazardTableFull { max: 2, .. })
    ));

    drop(leaf);
    drop(root);
    assert_eq!(session.hazard_count(), 0);
    Ok(())
}

#[test]
fn test_concurrent_readers_during_eviction() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    {
        let session = conn.open_session()?;
        for i in 0..200 {
            tree.put(&session, &key(i), &value(i))?;
        }
        conn.sync_tree(&session, &tree)?;
    }

    let stop = AtomicBool::new(false);
    thread::scope(|s| -> anyhow::Result<()> {
        let mut readers = Vec::new();
        for t in 0..4 {
            let (conn, tree, stop) = (&conn, &tree, &stop);
            readers.push(s.spawn(move || -> anyhow::Result<usize> {
                let session = conn.open_session()?;
                let mut reads = 0;
                let mut i = t;
                while !stop.load(Ordering::Relaxed) {
                    let got = tree.get(&session, &key(i % 200))?;
                    assert_eq!(got.as_ref(), &value(i % 200)[..]);
                    reads += 1;
                    i += 7;
                }
                Ok(reads)
            }));
        }

        let mut evicted = 0;
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            let leaf_ref = first_child(&tree)?;
            if let Some(leaf) = leaf_ref.page() {
                match conn.cache().evict_page_now(&tree, &leaf) {
                    Ok(()) => evicted += 1,
                    Err(e) if e.is_retryable() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            thread::yield_now();
        }
        stop.store(true, Ordering::Relaxed);

        for reader in readers {
            let reads = reader
                .join()
                .map_err(|_| anyhow::anyhow!("reader panicked"))??;
            assert!(reads > 0);
        }
        log::info!("evicted the leaf {} times under readers", evicted);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_memory_pressure_evicts_pages() -> anyhow::Result<()> {
    common::init_logging();
    let config = ConnectionConfig {
        cache_size: 1 << 18,
        ..ConnectionConfig::default()
    };
    let cache_size = config.cache_size;
    let conn = Connection::open(config)?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;

    let big = vec![b'x'; 400];
    for i in 0..2000 {
        tree.put(&session, &key(i), &big)?;
    }

    // Nothing holds a page now; the server catches up.
    let deadline = Instant::now() + Duration::from_secs(10);
    while conn.stats().bytes_in_use > cache_size && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let stats = conn.stats();
    assert!(stats.bytes_in_use <= cache_size, "{stats}");
    assert!(stats.pages_written > 0);
    assert!(stats.evict_split + stats.evict_dirty > 0);

    for i in (0..2000).step_by(97) {
        assert_eq!(tree.get(&session, &key(i))?.as_ref(), &big[..]);
    }
    Ok(())
}

#[test]
fn test_sync_writes_empty_tree() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    assert!(!tree.root().addr().is_valid());

    conn.sync_tree(&session, &tree)?;
    assert!(tree.root().addr().is_valid());
    assert!(first_child(&tree)?.addr().is_valid());
    assert_eq!(store.live_blocks(), 2);
    assert!(!root_page(&tree)?.is_dirty());
    Ok(())
}

#[test]
fn test_close_gives_up_while_a_page_is_held() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    let reader = conn.open_session()?;
    tree.put(&session, b"k", b"v")?;
    let search = tree.row_search(&reader, b"k")?;

    let started = Instant::now();
    let err = conn.close_tree(&session, &tree).unwrap_err();
    assert!(matches!(err, StorageError::Busy(_)), "{err}");
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(tree.row_value(&search)?.as_deref(), Some(&b"v"[..]));

    drop(search);
    conn.close_tree(&session, &tree)?;
    assert_eq!(tree.root().state(), RefState::Disk);
    Ok(())
}

#[test]
fn test_readers_finish_when_connection_closes() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    {
        let session = conn.open_session()?;
        for i in 0..50 {
            tree.put(&session, &key(i), &value(i))?;
        }
        conn.sync_tree(&session, &tree)?;
    }

    thread::scope(|s| -> anyhow::Result<()> {
        let mut readers = Vec::new();
        for t in 0..3 {
            let (conn, tree) = (&conn, &tree);
            readers.push(s.spawn(move || -> anyhow::Result<()> {
                let session = conn.open_session()?;
                let deadline = Instant::now() + Duration::from_secs(10);
                let mut i = t;
                while Instant::now() < deadline {
                    // Closing the tree evicts its root too.
                    if let Some(leaf) = first_child(tree).ok().and_then(|c| c.page()) {
                        let _ = conn.cache().evict_page_now(tree, &leaf);
                    }
                    match tree.get(&session, &key(i % 50)) {
                        Ok(got) => assert_eq!(got.as_ref(), &value(i % 50)[..]),
                        Err(StorageError::Closed) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                    i += 1;
                }
                Err(anyhow::anyhow!("reader never saw the connection close"))
            }));
        }

        thread::sleep(Duration::from_millis(50));
        // Readers may keep the tree busy; only the servers stopping matters.
        let _ = conn.close();
        for reader in readers {
            reader
                .join()
                .map_err(|_| anyhow::anyhow!("reader panicked"))??;
        }
        Ok(())
    })?;
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
    Evict,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3usize).prop_map(Op::Acquire),
        (0..3usize).prop_map(Op::Release),
        Just(Op::Evict),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A page is never evicted while any session holds it.
    #[test]
    fn prop_eviction_respects_hazards(ops in prop::collection::vec(op(), 1..40)) {
        let conn = connection().unwrap();
        let (_store, tree) = memory_tree(&conn, TreeConfig::row()).unwrap();
        let sessions: Vec<_> = (0..3).map(|_| conn.open_session().unwrap()).collect();
        tree.put(&sessions[0], b"k", b"v").unwrap();

        let root = root_page(&tree).unwrap();
        let leaf_ref = first_child(&tree).unwrap();
        let mut handles: Vec<Option<vibetree::PageHandle>> = vec![None, None, None];

        for op in ops {
            match op {
                Op::Acquire(i) => {
                    if handles[i].is_none() {
                        let handle = sessions[i]
                            .page_in(&tree, &leaf_ref, &Arc::downgrade(&root))
                            .unwrap();
                        prop_assert!(!handle.is_discarded());
                        handles[i] = Some(handle);
                    }
                }
                Op::Release(i) => {
                    handles[i] = None;
                }
                Op::Evict => {
                    let Some(leaf) = leaf_ref.page() else { continue };
                    let held = handles.iter().flatten().any(|h| h.id() == leaf.id());
                    let result = conn.cache().evict_page_now(&tree, &leaf);
                    prop_assert_eq!(result.is_ok(), !held);
                    if result.is_ok() {
                        prop_assert!(leaf.is_discarded());
                        prop_assert_eq!(leaf_ref.state(), RefState::Disk);
                    }
                }
            }
            for handle in handles.iter().flatten() {
                prop_assert!(!handle.is_discarded());
            }
        }
        drop(handles);
        let got = tree.get(&sessions[1], b"k").unwrap();
        prop_assert_eq!(got.as_ref(), b"v");
    }
}
