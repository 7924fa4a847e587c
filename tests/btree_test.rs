mod common;

use common::{connection, first_child, key, leaves, memory_tree, root_page, value};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;
use vibetree::btree::page::PageKind;
use vibetree::btree::RefState;
use vibetree::storage::FileBlockManager;
use vibetree::{StorageError, TreeConfig, TreeOptions, TreeType};

#[test]
fn test_row_put_get_remove() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;

    tree.put(&session, b"b", b"2")?;
    tree.put(&session, b"a", b"1")?;
    tree.put(&session, b"c", b"3")?;
    tree.put(&session, b"b", b"two")?;

    assert_eq!(tree.get(&session, b"a")?.as_ref(), b"1");
    assert_eq!(tree.get(&session, b"b")?.as_ref(), b"two");
    assert!(matches!(tree.get(&session, b"d"), Err(StorageError::NotFound)));

    tree.remove(&session, b"a")?;
    assert!(matches!(tree.get(&session, b"a"), Err(StorageError::NotFound)));
    assert!(matches!(tree.remove(&session, b"a"), Err(StorageError::NotFound)));

    // The same answers after a round trip through disk.
    let leaf = first_child(&tree)?
        .page()
        .ok_or_else(|| anyhow::anyhow!("leaf is not resident"))?;
    conn.cache().evict_page_now(&tree, &leaf)?;
    assert!(matches!(tree.get(&session, b"a"), Err(StorageError::NotFound)));
    assert_eq!(tree.get(&session, b"b")?.as_ref(), b"two");
    assert_eq!(tree.get(&session, b"c")?.as_ref(), b"3");
    Ok(())
}

#[test]
fn test_stale_search_conflicts() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    tree.put(&session, b"k", b"1")?;

    let stale = tree.row_search(&session, b"k")?;
    tree.put(&session, b"other", b"x")?;
    let err = tree
        .row_apply(&session, &stale, b"k", Some(b"2"))
        .unwrap_err();
    assert!(matches!(err, StorageError::WriteConflict { .. }));
    drop(stale);

    assert_eq!(tree.get(&session, b"k")?.as_ref(), b"1");
    Ok(())
}

#[test]
fn test_write_generation_race() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    {
        let session = conn.open_session()?;
        for i in 0..10 {
            tree.put(&session, format!("k{i}").as_bytes(), b"old")?;
        }
    }

    let barrier = Barrier::new(3);
    let results = thread::scope(|s| {
        let workers: Vec<_> = (0..3)
            .map(|t| {
                let (conn, tree, barrier) = (&conn, &tree, &barrier);
                s.spawn(move || -> anyhow::Result<Result<(), StorageError>> {
                    let session = conn.open_session()?;
                    let search = tree.row_search(&session, b"k5")?;
                    barrier.wait();
                    let value = format!("new-{t}");
                    Ok(tree.row_apply(&session, &search, b"k5", Some(value.as_bytes())))
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().map_err(|_| anyhow::anyhow!("worker panicked"))?)
            .collect::<anyhow::Result<Vec<_>>>()
    })?;

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(StorageError::WriteConflict { .. })))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 2);

    let session = conn.open_session()?;
    assert!(tree.get(&session, b"k5")?.starts_with(b"new-"));
    Ok(())
}

#[test]
fn test_clean_reconcile_does_not_write() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    for i in 0..50 {
        tree.put(&session, &key(i), &value(i))?;
    }
    conn.sync_tree(&session, &tree)?;
    let written = conn.stats().pages_written;
    let (_, writes) = store.io_counts();
    assert!(written >= 2);

    conn.sync_tree(&session, &tree)?;
    assert_eq!(conn.stats().pages_written, written);
    assert_eq!(store.io_counts().1, writes);

    // Evicting a clean page drops it without writing.
    let leaf = first_child(&tree)?
        .page()
        .ok_or_else(|| anyhow::anyhow!("leaf is not resident"))?;
    conn.cache().evict_page_now(&tree, &leaf)?;
    assert_eq!(store.io_counts().1, writes);
    assert_eq!(conn.stats().evict_clean, 1);
    Ok(())
}

#[test]
fn test_row_split_leaves_are_ordered() -> anyhow::Result<()> {
    let conn = connection()?;
    let config = TreeConfig {
        leaf_page_max: 4096,
        ..TreeConfig::row()
    };
    let (store, tree) = memory_tree(&conn, config)?;
    let session = conn.open_session()?;
    for i in (0..1000).rev() {
        tree.put(&session, &key(i), &value(i))?;
    }
    conn.close_tree(&session, &tree)?;
    assert!(conn.stats().evict_split > 0);

    let tree = conn.open_tree("test", store.clone(), TreeOptions::default())?;
    let found = leaves(&session, &tree)?;
    assert!(found.len() > 1);
    assert_eq!(found[0].first_key.as_deref(), Some(&key(0)[..]));
    assert_eq!(found[found.len() - 1].last_key.as_deref(), Some(&key(999)[..]));
    for pair in found.windows(2) {
        assert!(pair[0].last_key < pair[1].first_key);
    }
    for i in 0..1000 {
        assert_eq!(tree.get(&session, &key(i))?.as_ref(), &value(i)[..]);
    }
    Ok(())
}

#[test]
fn test_column_split_leaves_are_contiguous() -> anyhow::Result<()> {
    let conn = connection()?;
    let config = TreeConfig {
        leaf_page_max: 4096,
        ..TreeConfig::column_variable()
    };
    let (store, tree) = memory_tree(&conn, config)?;
    let session = conn.open_session()?;
    for i in 1..=1000 {
        assert_eq!(tree.col_append(&session, &value(i))?, i as u64);
    }
    conn.close_tree(&session, &tree)?;

    let tree = conn.open_tree("test", store.clone(), TreeOptions::default())?;
    assert_eq!(tree.last_recno(), 1000);
    let found = leaves(&session, &tree)?;
    assert!(found.len() > 1);
    assert_eq!(found[0].recno, 1);
    assert_eq!(found[found.len() - 1].last_recno, 1000);
    for pair in found.windows(2) {
        assert_eq!(pair[0].last_recno + 1, pair[1].recno);
    }
    for i in (1..=1000).step_by(37) {
        assert_eq!(tree.col_get(&session, i as u64)?.as_ref(), &value(i)[..]);
    }
    Ok(())
}

#[test]
fn test_rle_groups_remerge() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::column_variable())?;
    let session = conn.open_session()?;
    for _ in 0..10 {
        tree.col_append(&session, b"a")?;
    }

    let groups = |conn: &vibetree::Connection| -> anyhow::Result<Vec<(u64, u64)>> {
        let leaf_ref = first_child(&tree)?;
        if let Some(leaf) = leaf_ref.page() {
            conn.cache().evict_page_now(&tree, &leaf)?;
        }
        let root = root_page(&tree)?;
        let leaf = session.page_in(&tree, &leaf_ref, &Arc::downgrade(&root))?;
        let col = leaf
            .col_var()
            .ok_or_else(|| anyhow::anyhow!("not a variable-length leaf"))?;
        Ok(col.slots.iter().map(|s| (s.recno, s.rle())).collect())
    };

    assert_eq!(groups(&conn)?, vec![(1, 10)]);

    tree.col_put(&session, 5, b"b")?;
    assert_eq!(groups(&conn)?, vec![(1, 4), (5, 1), (6, 5)]);
    assert_eq!(tree.col_get(&session, 5)?.as_ref(), b"b");

    tree.col_put(&session, 5, b"a")?;
    assert_eq!(groups(&conn)?, vec![(1, 10)]);

    tree.col_remove(&session, 10)?;
    assert_eq!(groups(&conn)?, vec![(1, 9), (10, 1)]);
    assert!(matches!(tree.col_get(&session, 10), Err(StorageError::NotFound)));
    assert_eq!(tree.col_get(&session, 9)?.as_ref(), b"a");
    Ok(())
}

#[test]
fn test_fixed_length_values() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::column_fixed(4))?;
    let session = conn.open_session()?;

    assert_eq!(tree.col_append(&session, &[0xff])?, 1);
    assert_eq!(tree.col_append(&session, &[0x03])?, 2);
    assert!(matches!(
        tree.col_append(&session, b"too long"),
        Err(StorageError::InvalidConfig(_))
    ));
    assert_eq!(tree.col_get(&session, 1)?.as_ref(), &[0x0f]);

    tree.col_remove(&session, 2)?;
    assert_eq!(tree.col_get(&session, 2)?.as_ref(), &[0]);
    assert!(matches!(tree.col_get(&session, 3), Err(StorageError::NotFound)));
    assert!(matches!(
        tree.col_put(&session, 3, &[1]),
        Err(StorageError::NotFound)
    ));

    conn.sync_tree(&session, &tree)?;
    let leaf = first_child(&tree)?
        .page()
        .ok_or_else(|| anyhow::anyhow!("leaf is not resident"))?;
    conn.cache().evict_page_now(&tree, &leaf)?;
    assert_eq!(tree.col_get(&session, 1)?.as_ref(), &[0x0f]);
    assert_eq!(tree.col_get(&session, 2)?.as_ref(), &[0]);
    Ok(())
}

#[test]
fn test_overflow_items_are_reused_and_freed() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    let big = vec![7u8; 5000];
    assert!(big.len() > TreeConfig::row().leaf_item_max() as usize);

    tree.put(&session, b"big", &big)?;
    tree.put(&session, b"small", b"s")?;
    conn.sync_tree(&session, &tree)?;
    // Root, leaf and the overflow item.
    assert_eq!(store.live_blocks(), 3);
    assert_eq!(conn.stats().overflow_writes, 1);

    tree.put(&session, b"big", &big)?;
    conn.sync_tree(&session, &tree)?;
    assert_eq!(store.live_blocks(), 3);
    assert_eq!(conn.stats().overflow_writes, 1);
    assert_eq!(tree.get(&session, b"big")?.as_ref(), &big[..]);

    tree.put(&session, b"big", b"tiny")?;
    conn.sync_tree(&session, &tree)?;
    assert_eq!(store.live_blocks(), 2);

    conn.close_tree(&session, &tree)?;
    let tree = conn.open_tree("test", store.clone(), TreeOptions::default())?;
    assert_eq!(tree.get(&session, b"big")?.as_ref(), b"tiny");
    assert_eq!(tree.get(&session, b"small")?.as_ref(), b"s");
    Ok(())
}

#[test]
fn test_failed_write_leaves_tree_retryable() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    let big = vec![7u8; 5000];
    let bigger = vec![9u8; 6000];
    tree.put(&session, b"big", &big)?;
    tree.put(&session, b"small", b"s")?;
    conn.sync_tree(&session, &tree)?;
    let blocks = store.live_blocks();

    tree.put(&session, b"big", &bigger)?;
    tree.put(&session, b"other", &big)?;
    tree.put(&session, b"small", b"t")?;
    store.fail_writes(true);
    let err = conn.sync_tree(&session, &tree).unwrap_err();
    assert!(matches!(err, StorageError::Io(_)), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(store.live_blocks(), blocks);
    assert!(first_child(&tree)?
        .page()
        .is_some_and(|leaf| leaf.is_dirty()));
    assert_eq!(tree.get(&session, b"big")?.as_ref(), &bigger[..]);
    assert_eq!(tree.get(&session, b"other")?.as_ref(), &big[..]);
    assert_eq!(tree.get(&session, b"small")?.as_ref(), b"t");

    store.fail_writes(false);
    conn.close_tree(&session, &tree)?;
    let tree = conn.open_tree("test", store.clone(), TreeOptions::default())?;
    assert_eq!(tree.get(&session, b"big")?.as_ref(), &bigger[..]);
    assert_eq!(tree.get(&session, b"other")?.as_ref(), &big[..]);
    assert_eq!(tree.get(&session, b"small")?.as_ref(), b"t");
    Ok(())
}

#[test]
fn test_overflow_keys_round_trip() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    let long_key = vec![b'k'; 4000];
    tree.put(&session, &long_key, b"value")?;
    tree.put(&session, b"a", b"before")?;
    conn.close_tree(&session, &tree)?;

    let tree = conn.open_tree("test", store.clone(), TreeOptions::default())?;
    assert_eq!(tree.get(&session, &long_key)?.as_ref(), b"value");
    assert_eq!(tree.get(&session, b"a")?.as_ref(), b"before");
    assert!(conn.stats().overflow_reads > 0);
    Ok(())
}

#[test]
fn test_bulk_load_fixed_length() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::column_fixed(8))?;
    let session = conn.open_session()?;

    let mut load = tree.bulk_load(&session, Some(100))?;
    assert!(tree.is_no_eviction());
    for i in 1..=1000u64 {
        assert_eq!(load.append(&[(i % 256) as u8])?, i);
    }
    assert_eq!(load.count(), 1000);
    load.finish()?;
    assert!(!tree.is_no_eviction());
    assert_eq!(tree.last_recno(), 1000);

    let root = root_page(&tree)?;
    assert!(root.is_pinned());
    let PageKind::ColInternal(intl) = root.kind() else {
        anyhow::bail!("root is not a column internal page");
    };
    let recnos: Vec<u64> = intl.children.iter().map(|c| c.recno).collect();
    assert_eq!(recnos, (0..10).map(|i| i * 100 + 1).collect::<Vec<_>>());
    assert!(intl.children.iter().all(|c| c.pref.state() == RefState::Disk));

    for i in [1u64, 100, 101, 555, 1000] {
        assert_eq!(tree.col_get(&session, i)?.as_ref(), &[(i % 256) as u8]);
    }
    Ok(())
}

#[test]
fn test_bulk_load_rows() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;

    let mut load = tree.bulk_load(&session, Some(64))?;
    for i in 0..500 {
        load.insert(&key(i), &value(i))?;
    }
    let err = load.insert(&key(3), b"late").unwrap_err();
    assert!(matches!(err, StorageError::BulkLoad(_)));
    load.finish()?;

    let found = leaves(&session, &tree)?;
    assert_eq!(found.len(), 8);
    for i in 0..500 {
        assert_eq!(tree.get(&session, &key(i))?.as_ref(), &value(i)[..]);
    }

    conn.close_tree(&session, &tree)?;
    let tree = conn.open_tree("test", store.clone(), TreeOptions::default())?;
    assert_eq!(tree.get(&session, &key(499))?.as_ref(), &value(499)[..]);
    Ok(())
}

#[test]
fn test_bulk_load_requires_empty_tree() -> anyhow::Result<()> {
    let conn = connection()?;
    let (_store, tree) = memory_tree(&conn, TreeConfig::row())?;
    let session = conn.open_session()?;
    assert!(matches!(
        tree.bulk_load(&session, Some(0)),
        Err(StorageError::InvalidConfig(_))
    ));

    tree.put(&session, b"k", b"v")?;
    assert!(matches!(
        tree.bulk_load(&session, None),
        Err(StorageError::BulkLoad(_))
    ));

    let (_store, col) = memory_tree(&conn, TreeConfig::column_variable())?;
    let mut load = col.bulk_load(&session, None)?;
    assert!(matches!(
        load.insert(b"k", b"v"),
        Err(StorageError::BulkLoad(_))
    ));
    drop(load);
    assert!(!col.is_no_eviction());
    Ok(())
}

#[test]
fn test_reopen_file_backed_tree() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("tree.db");
    let conn = connection()?;
    let session = conn.open_session()?;

    {
        let store = Arc::new(FileBlockManager::create(&path, 512)?);
        let tree = conn.open_tree("file", store.clone(), TreeOptions::default())?;
        for i in 0..300 {
            tree.put(&session, &key(i), &value(i))?;
        }
        tree.remove(&session, &key(7))?;
        conn.close_tree(&session, &tree)?;
        store.close()?;
    }

    let store = Arc::new(FileBlockManager::open(&path)?);
    let tree = conn.open_tree("file", store.clone(), TreeOptions::default())?;
    assert_eq!(tree.config().tree_type, TreeType::Row);
    assert!(root_page(&tree)?.is_pinned());
    for i in 0..300 {
        match i {
            7 => assert!(matches!(tree.get(&session, &key(i)), Err(StorageError::NotFound))),
            _ => assert_eq!(tree.get(&session, &key(i))?.as_ref(), &value(i)[..]),
        }
    }
    Ok(())
}

#[test]
fn test_column_tree_reopens_with_last_recno() -> anyhow::Result<()> {
    let conn = connection()?;
    let (store, tree) = memory_tree(&conn, TreeConfig::column_variable())?;
    let session = conn.open_session()?;
    for i in 0..25 {
        tree.col_append(&session, &value(i))?;
    }
    conn.close_tree(&session, &tree)?;

    let tree = conn.open_tree("test", store.clone(), TreeOptions::default())?;
    assert_eq!(tree.last_recno(), 25);
    assert_eq!(tree.col_append(&session, b"next")?, 26);
    assert_eq!(tree.col_get(&session, 26)?.as_ref(), b"next");
    Ok(())
}

fn entries() -> impl Strategy<Value = BTreeMap<Vec<u8>, Vec<u8>>> {
    let key = prop::collection::vec(any::<u8>(), 1..24);
    let value = prop_oneof![
        4 => prop::collection::vec(any::<u8>(), 0..64),
        1 => prop::collection::vec(any::<u8>(), 3500..5000),
    ];
    prop::collection::btree_map(key, value, 1..120)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever is written comes back after the tree is closed and reopened.
    #[test]
    fn prop_row_tree_survives_reopen(entries in entries(), removed in prop::collection::vec(any::<prop::sample::Index>(), 0..10)) {
        let conn = connection().unwrap();
        let config = TreeConfig { leaf_page_max: 8192, ..TreeConfig::row() };
        let (store, tree) = memory_tree(&conn, config).unwrap();
        let session = conn.open_session().unwrap();

        for (k, v) in &entries {
            tree.put(&session, k, v).unwrap();
        }
        let keys: Vec<_> = entries.keys().cloned().collect();
        let mut expected = entries.clone();
        for index in removed {
            let k = index.get(&keys);
            if expected.remove(k).is_some() {
                tree.remove(&session, k).unwrap();
            }
        }
        conn.close_tree(&session, &tree).unwrap();

        let tree = conn.open_tree("test", store.clone(), TreeOptions::default()).unwrap();
        for k in &keys {
            match expected.get(k) {
                Some(v) => {
                    let got = tree.get(&session, k).unwrap();
                    prop_assert_eq!(got.as_ref(), &v[..]);
                }
                None => prop_assert!(matches!(tree.get(&session, k), Err(StorageError::NotFound))),
            }
        }
    }

    #[test]
    fn prop_column_tree_survives_reopen(values in prop::collection::vec(prop::collection::vec(0u8..3, 1..3), 1..300)) {
        let conn = connection().unwrap();
        let config = TreeConfig { leaf_page_max: 4096, ..TreeConfig::column_variable() };
        let (store, tree) = memory_tree(&conn, config).unwrap();
        let session = conn.open_session().unwrap();
        for v in &values {
            tree.col_append(&session, v).unwrap();
        }
        conn.close_tree(&session, &tree).unwrap();

        let tree = conn.open_tree("test", store.clone(), TreeOptions::default()).unwrap();
        prop_assert_eq!(tree.last_recno(), values.len() as u64);
        for (i, v) in values.iter().enumerate() {
            let got = tree.col_get(&session, i as u64 + 1).unwrap();
            prop_assert_eq!(got.as_ref(), &v[..]);
        }
    }
}
