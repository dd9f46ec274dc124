//! Integration tests for the public `Store` API.
//!
//! These tests exercise the full storage stack (WAL → memtable →
//! segment → compaction) through the public `stratakv::{Store, Options,
//! StoreError}` surface only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, idempotent close, destroy
//! - **CRUD**: put, get, delete, overwrite, missing keys
//! - **Scan**: bounds, tombstone filtering
//! - **Persistence**: data and deletes survive close → reopen, crash
//!   recovery via drop-without-close
//! - **Compaction**: range compaction preserves data, collects deletes
//! - **Validation**: bad options and empty keys rejected
//! - **Concurrency**: multi-thread writers and readers
//! - **Full-stack**: a sustained mixed workload with periodic flushes
//!   and compactions

use std::sync::Arc;
use std::thread;

use stratakv::{Options, Store, StoreError};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Small write buffer so freezes and background flushes happen often.
fn small_buffer_options() -> Options {
    Options {
        write_buffer_size: 1024,
        segment_target_size: 4096,
        level_base_size: 16 * 1024,
        ..Options::default()
    }
}

fn reopen(path: &std::path::Path) -> Store {
    Store::open(path, Options::default()).expect("reopen")
}

fn make_key(i: u32) -> Vec<u8> {
    format!("key-{i:08}").into_bytes()
}

fn make_value(i: u32) -> Vec<u8> {
    format!("value-{i}").into_bytes()
}

// ================================================================================================
// Lifecycle
// ================================================================================================

#[test]
fn test_open_put_get_close() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();

    store.put(b"hello", b"world").unwrap();
    assert_eq!(store.get(b"hello").unwrap(), Some(b"world".to_vec()));

    store.close().unwrap();
}

#[test]
fn test_close_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();

    store.close().unwrap();
    store.close().unwrap();
}

#[test]
fn test_operations_after_close_fail() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();
    store.close().unwrap();

    assert!(matches!(store.put(b"k", b"v"), Err(StoreError::Closed)));
    assert!(matches!(store.get(b"k"), Err(StoreError::Closed)));
    assert!(matches!(store.delete(b"k"), Err(StoreError::Closed)));
    assert!(matches!(store.flush(), Err(StoreError::Closed)));
    assert!(matches!(store.scan(None, None), Err(StoreError::Closed)));
}

#[test]
fn test_open_missing_without_create_fails() {
    let tmp = TempDir::new().unwrap();
    let options = Options {
        create_if_missing: false,
        ..Options::default()
    };
    let result = Store::open(tmp.path().join("absent"), options);
    assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
}

#[test]
fn test_open_existing_with_error_if_exists_fails() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(tmp.path(), Options::default()).unwrap();
        store.put(b"a", b"1").unwrap();
        store.close().unwrap();
    }

    let options = Options {
        error_if_exists: true,
        ..Options::default()
    };
    assert!(Store::open(tmp.path(), options).is_err());
}

#[test]
fn test_destroy_removes_store() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("db");
    {
        let store = Store::open(&path, Options::default()).unwrap();
        for i in 0..100u32 {
            store.put(&make_key(i), &make_value(i)).unwrap();
        }
        store.flush().unwrap();
        store.close().unwrap();
    }

    Store::destroy(&path).unwrap();
    assert!(!path.exists());

    // Destroying an absent store is fine.
    Store::destroy(&path).unwrap();

    // A fresh open after destroy starts empty.
    let store = Store::open(&path, Options::default()).unwrap();
    assert_eq!(store.get(&make_key(0)).unwrap(), None);
    store.close().unwrap();
}

#[test]
fn test_destroy_sweeps_past_a_failing_subdirectory() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("db");
    {
        let store = Store::open(&path, Options::default()).unwrap();
        store.put(b"a", b"1").unwrap();
        store.flush().unwrap();
        store.close().unwrap();
    }

    // Make the wal subdirectory unremovable by replacing it with a
    // plain file of the same name.
    let wal_dir = path.join("wal");
    std::fs::remove_dir_all(&wal_dir).unwrap();
    std::fs::write(&wal_dir, b"in the way").unwrap();

    // The failure is reported, but the other subdirectories are still
    // swept.
    assert!(matches!(Store::destroy(&path), Err(StoreError::Io(_))));
    assert!(!path.join("segments").exists());
    assert!(!path.join("manifest").exists());
    assert!(wal_dir.exists());
}

// ================================================================================================
// Validation
// ================================================================================================

#[test]
fn test_empty_key_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();

    assert!(matches!(
        store.put(b"", b"v"),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.get(b""),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.delete(b""),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_oversized_value_is_resource_exhausted() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();

    // Larger than the write-ahead log's 64 MiB record cap.
    let huge = vec![0u8; 65 * 1024 * 1024];
    assert!(matches!(
        store.put(b"key", &huge),
        Err(StoreError::ResourceExhausted(_))
    ));

    // The failed write left no trace; the store keeps working.
    assert_eq!(store.get(b"key").unwrap(), None);
    store.put(b"key", b"small").unwrap();
    assert_eq!(store.get(b"key").unwrap(), Some(b"small".to_vec()));
}

#[test]
fn test_empty_value_is_allowed() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();

    store.put(b"key", b"").unwrap();
    assert_eq!(store.get(b"key").unwrap(), Some(Vec::new()));
}

#[test]
fn test_invalid_options_rejected() {
    let tmp = TempDir::new().unwrap();
    for options in [
        Options {
            write_buffer_size: 0,
            ..Options::default()
        },
        Options {
            max_open_files: 0,
            ..Options::default()
        },
        Options {
            l0_compaction_threshold: 1,
            ..Options::default()
        },
        Options {
            background_threads: 0,
            ..Options::default()
        },
    ] {
        let result = Store::open(tmp.path(), options);
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
    }
}

// ================================================================================================
// CRUD and scans
// ================================================================================================

#[test]
fn test_missing_key_is_none_not_error() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();
    assert_eq!(store.get(b"nope").unwrap(), None);
    store.delete(b"nope").unwrap();
}

#[test]
fn test_overwrite_and_delete() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();

    store.put(b"key", b"v1").unwrap();
    store.put(b"key", b"v2").unwrap();
    assert_eq!(store.get(b"key").unwrap(), Some(b"v2".to_vec()));

    store.delete(b"key").unwrap();
    assert_eq!(store.get(b"key").unwrap(), None);
}

#[test]
fn test_binary_keys_and_values() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();

    let key = vec![0u8, 255, 128, 7];
    let value = vec![1u8, 0, 254];
    store.put(&key, &value).unwrap();
    store.flush().unwrap();
    assert_eq!(store.get(&key).unwrap(), Some(value));
}

#[test]
fn test_scan_bounds_and_tombstones() {
    let tmp = TempDir::new().unwrap();
    let store = Store::open(tmp.path(), Options::default()).unwrap();

    for i in 0..10u32 {
        store.put(&make_key(i), &make_value(i)).unwrap();
    }
    store.delete(&make_key(5)).unwrap();

    let pairs = store.scan(Some(&make_key(3)), Some(&make_key(8))).unwrap();
    let keys: Vec<Vec<u8>> = pairs.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(
        keys,
        vec![make_key(3), make_key(4), make_key(6), make_key(7)]
    );
}

// ================================================================================================
// Persistence
// ================================================================================================

#[test]
fn test_data_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(tmp.path(), Options::default()).unwrap();
        for i in 0..100u32 {
            store.put(&make_key(i), &make_value(i)).unwrap();
        }
        store.delete(&make_key(17)).unwrap();
        store.close().unwrap();
    }

    let store = reopen(tmp.path());
    for i in 0..100u32 {
        let expected = if i == 17 { None } else { Some(make_value(i)) };
        assert_eq!(store.get(&make_key(i)).unwrap(), expected, "key {i}");
    }
}

#[test]
fn test_crash_recovery_without_close() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(tmp.path(), Options::default()).unwrap();
        store.put(b"durable", b"yes").unwrap();
        // Simulated crash: dropped without an explicit close.
    }

    let store = reopen(tmp.path());
    assert_eq!(store.get(b"durable").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn test_deletes_survive_compaction_and_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(tmp.path(), small_buffer_options()).unwrap();
        for i in 0..50u32 {
            store.put(&make_key(i), &make_value(i)).unwrap();
        }
        store.flush().unwrap();
        for i in (0..50u32).step_by(2) {
            store.delete(&make_key(i)).unwrap();
        }
        store.compact_range(None, None).unwrap();
        store.close().unwrap();
    }

    let store = reopen(tmp.path());
    for i in 0..50u32 {
        let expected = if i % 2 == 0 { None } else { Some(make_value(i)) };
        assert_eq!(store.get(&make_key(i)).unwrap(), expected, "key {i}");
    }
}

// ================================================================================================
// Concurrency
// ================================================================================================

#[test]
fn test_concurrent_writers() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Store::open(tmp.path(), small_buffer_options()).unwrap());

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..100u32 {
                let key = format!("writer-{t}-key-{i:04}");
                store.put(key.as_bytes(), key.as_bytes()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4u32 {
        for i in 0..100u32 {
            let key = format!("writer-{t}-key-{i:04}");
            assert_eq!(
                store.get(key.as_bytes()).unwrap(),
                Some(key.clone().into_bytes()),
                "key {key}"
            );
        }
    }
}

#[test]
fn test_readers_during_writes() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Store::open(tmp.path(), small_buffer_options()).unwrap());
    for i in 0..100u32 {
        store.put(&make_key(i), &make_value(i)).unwrap();
    }

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 100..300u32 {
                store.put(&make_key(i), &make_value(i)).unwrap();
            }
        })
    };
    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for _ in 0..10 {
                for i in 0..100u32 {
                    assert_eq!(store.get(&make_key(i)).unwrap(), Some(make_value(i)));
                }
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();
}

// ================================================================================================
// Full-stack workload
// ================================================================================================

/// # Scenario
/// A sustained mixed workload: 10,000 writes with a flush every 1,000
/// and a full-range compaction every 4,000, overwrites for one key in
/// ten, deletes for one in twenty.
///
/// # Expected behavior
/// After the dust settles and a reopen, every key reads back exactly
/// as last written.
#[test]
fn test_sustained_workload() {
    let tmp = TempDir::new().unwrap();
    {
        let store = Store::open(tmp.path(), small_buffer_options()).unwrap();

        for i in 0..10_000u32 {
            store.put(&make_key(i), &make_value(i)).unwrap();
            if i % 10 == 0 {
                store.put(&make_key(i), b"overwritten").unwrap();
            }
            if i % 20 == 0 {
                store.delete(&make_key(i)).unwrap();
            }
            if (i + 1) % 1_000 == 0 {
                store.flush().unwrap();
            }
            if (i + 1) % 4_000 == 0 {
                store.compact_range(None, None).unwrap();
            }
        }
        store.close().unwrap();
    }

    let store = reopen(tmp.path());
    for i in 0..10_000u32 {
        let expected = if i % 20 == 0 {
            None
        } else if i % 10 == 0 {
            Some(b"overwritten".to_vec())
        } else {
            Some(make_value(i))
        };
        assert_eq!(store.get(&make_key(i)).unwrap(), expected, "key {i}");
    }

    let pairs = store.scan(Some(&make_key(100)), Some(&make_key(200))).unwrap();
    // 100 keys in range, every twentieth deleted.
    assert_eq!(pairs.len(), 95);
    store.close().unwrap();
}
