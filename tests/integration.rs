//! Integration tests for the public API.
//!
//! These tests exercise the full stack (tree → memory segment → segment
//! codec → disk segment → overlay → compaction) through the public
//! `stratadb::{Database, Transaction}` surface only. No internal modules
//! are referenced.
//!
//! ## Coverage areas
//! - **Lifecycle**: open, close, close-with-merge, reopen, remove
//! - **CRUD**: put, get, remove, overwrite, validation errors
//! - **Scan**: range bounds, tombstone filtering, ordering
//! - **Persistence**: committed data survives close → reopen
//! - **Shadowing**: newer segments win across commits and merges
//! - **Visibility**: read-your-writes, begin-time snapshots
//! - **Concurrency**: parallel writers on shared and distinct tables

use std::fs;
use std::path::Path;

use stratadb::{Database, DbError};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Count segment files (`.keys.` / `.data.`) in a database directory.
fn segment_file_count(path: &Path) -> usize {
    fs::read_dir(path)
        .unwrap()
        .filter(|entry| {
            let name = entry.as_ref().unwrap().file_name();
            let name = name.to_string_lossy().into_owned();
            name.contains(".keys.") || name.contains(".data.")
        })
        .count()
}

/// Collect a full-range scan into owned pairs.
fn scan_all(db: &Database, table: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    let tx = db.begin_tx(table).unwrap();
    let entries = tx
        .lookup(None, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    tx.rollback();
    entries
}

// ================================================================================================
// CRUD basics
// ================================================================================================

/// # Scenario
/// Stage writes, read them back inside the same transaction, remove one.
///
/// # Expected behavior
/// Read-your-writes within the transaction; the removed key reads as
/// absent; oversized keys are rejected.
#[test]
fn put_get_remove_within_one_transaction() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"mykey", b"myvalue").unwrap();
    assert_eq!(tx.get(b"mykey").unwrap(), Some(b"myvalue".to_vec()));
    tx.put(b"mykey2", b"myvalue2").unwrap();
    assert_eq!(tx.get(b"mykey2").unwrap(), Some(b"myvalue2".to_vec()));

    let large = vec![b'k'; 1025];
    assert!(matches!(
        tx.put(&large, b"myvalue"),
        Err(DbError::KeyTooLong)
    ));

    assert_eq!(tx.remove(b"mykey").unwrap(), Some(b"myvalue".to_vec()));
    assert_eq!(tx.get(b"mykey").unwrap(), None);

    tx.commit();
    db.close_with_merge(1).unwrap();

    // The tombstone must hold across a reopen as well.
    let db = Database::open(dir.path(), true).unwrap();
    let tx = db.begin_tx("main").unwrap();
    assert_eq!(tx.get(b"mykey").unwrap(), None);
    assert_eq!(tx.get(b"mykey2").unwrap(), Some(b"myvalue2".to_vec()));
    tx.commit();
    db.close().unwrap();
}

/// # Scenario
/// Key validation at the API boundary.
///
/// # Expected behavior
/// Zero-length keys → `EmptyKey`; 1025-byte keys → `KeyTooLong`; a
/// 1024-byte key is accepted. Oversized keys are rejected on reads too.
#[test]
fn key_validation() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    assert!(matches!(tx.put(b"", b"value"), Err(DbError::EmptyKey)));
    assert!(matches!(
        tx.put(&vec![b'x'; 1025], b"value"),
        Err(DbError::KeyTooLong)
    ));
    assert!(matches!(
        tx.get(&vec![b'x'; 1025]),
        Err(DbError::KeyTooLong)
    ));
    assert!(matches!(
        tx.remove(&vec![b'x'; 1025]),
        Err(DbError::KeyTooLong)
    ));

    let max_key = vec![b'x'; 1024];
    tx.put(&max_key, b"value").unwrap();
    assert_eq!(tx.get(&max_key).unwrap(), Some(b"value".to_vec()));

    tx.commit_sync().unwrap();
    db.close().unwrap();
}

/// # Scenario
/// Removing a key that only exists in an older, already-flushed segment.
///
/// # Expected behavior
/// `remove` returns the value found through the overlay and the deletion
/// shadows the older segment.
#[test]
fn remove_returns_value_from_older_segment() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"mykey", b"myvalue").unwrap();
    tx.commit_sync().unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    assert_eq!(tx.remove(b"mykey").unwrap(), Some(b"myvalue".to_vec()));
    assert_eq!(tx.get(b"mykey").unwrap(), None);
    // Removing an unknown key is not an error and reports no old value.
    assert_eq!(tx.remove(b"never-existed").unwrap(), None);
    tx.commit_sync().unwrap();

    let tx = db.begin_tx("main").unwrap();
    assert_eq!(tx.get(b"mykey").unwrap(), None);
    tx.rollback();
    db.close().unwrap();
}

// ================================================================================================
// Persistence
// ================================================================================================

/// # Scenario
/// `put; commit; close; open; get`.
///
/// # Expected behavior
/// The committed value is there after a full close/reopen cycle.
#[test]
fn committed_write_survives_reopen() {
    let dir = TempDir::new().unwrap();

    let db = Database::open(dir.path(), true).unwrap();
    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"mykey", b"myvalue").unwrap();
    tx.commit();
    db.close().unwrap();

    let db = Database::open(dir.path(), false).unwrap();
    let tx = db.begin_tx("main").unwrap();
    assert_eq!(tx.get(b"mykey").unwrap(), Some(b"myvalue".to_vec()));
    tx.commit();
    db.close().unwrap();
}

/// # Scenario
/// Write, merge to one segment, reopen, delete, merge again, reopen.
///
/// # Expected behavior
/// After the second cycle the key is gone from point reads and scans, and
/// each table still materializes as exactly one segment pair.
#[test]
fn removed_key_stays_removed_across_merges() {
    let dir = TempDir::new().unwrap();

    let db = Database::open(dir.path(), true).unwrap();
    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"mykey", b"myvalue").unwrap();
    tx.commit();
    db.close_with_merge(1).unwrap();

    let db = Database::open(dir.path(), true).unwrap();
    let mut tx = db.begin_tx("main").unwrap();
    tx.remove(b"mykey").unwrap();
    tx.commit();
    db.close_with_merge(1).unwrap();
    assert_eq!(segment_file_count(dir.path()), 2);

    let db = Database::open(dir.path(), true).unwrap();
    let tx = db.begin_tx("main").unwrap();
    assert_eq!(tx.get(b"mykey").unwrap(), None);
    let mut scan = tx.lookup(None, None).unwrap();
    assert!(scan.next().is_none(), "scan must not resurrect removed keys");
    tx.commit();
    db.close_with_merge(1).unwrap();
}

/// # Scenario
/// 100 single-entry transactions on table `main`, then close with a merge
/// target of one segment.
///
/// # Expected behavior
/// Exactly two files remain for the table (one keys + one data); a
/// reopened full-range scan yields all 100 entries in order.
#[test]
fn hundred_commits_merge_to_one_segment() {
    let dir = TempDir::new().unwrap();

    let db = Database::open(dir.path(), true).unwrap();
    for i in 0..100 {
        let mut tx = db.begin_tx("main").unwrap();
        tx.put(
            format!("mykey{i}").as_bytes(),
            format!("myvalue{i}").as_bytes(),
        )
        .unwrap();
        tx.commit();
    }
    db.close_with_merge(1).unwrap();

    assert_eq!(segment_file_count(dir.path()), 2);

    let db = Database::open(dir.path(), false).unwrap();
    let entries = scan_all(&db, "main");
    assert_eq!(entries.len(), 100);
    for window in entries.windows(2) {
        assert!(window[0].0 < window[1].0, "scan out of order");
    }
    db.close().unwrap();
}

// ================================================================================================
// Shadowing and visibility
// ================================================================================================

/// # Scenario
/// Overwrite the same key in two separate committed transactions.
///
/// # Expected behavior
/// The newer segment shadows the older; reads see the second value, both
/// before and after merging.
#[test]
fn newer_commit_shadows_older() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"mykey", b"v1").unwrap();
    tx.commit_sync().unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"mykey", b"v2").unwrap();
    tx.commit_sync().unwrap();

    let tx = db.begin_tx("main").unwrap();
    assert_eq!(tx.get(b"mykey").unwrap(), Some(b"v2".to_vec()));
    tx.rollback();

    db.close_with_merge(1).unwrap();

    let db = Database::open(dir.path(), false).unwrap();
    let tx = db.begin_tx("main").unwrap();
    assert_eq!(tx.get(b"mykey").unwrap(), Some(b"v2".to_vec()));
    tx.rollback();
    db.close().unwrap();
}

/// # Scenario
/// A transaction begins, then another transaction commits synchronously.
///
/// # Expected behavior
/// The first transaction keeps reading its begin-time snapshot; a
/// transaction begun after the commit sees the new value.
#[test]
fn snapshot_is_fixed_at_begin_time() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut setup = db.begin_tx("main").unwrap();
    setup.put(b"mykey", b"old").unwrap();
    setup.commit_sync().unwrap();

    let early = db.begin_tx("main").unwrap();

    let mut writer = db.begin_tx("main").unwrap();
    writer.put(b"mykey", b"new").unwrap();
    writer.commit_sync().unwrap();

    assert_eq!(early.get(b"mykey").unwrap(), Some(b"old".to_vec()));

    let late = db.begin_tx("main").unwrap();
    assert_eq!(late.get(b"mykey").unwrap(), Some(b"new".to_vec()));

    early.rollback();
    late.rollback();
    db.close().unwrap();
}

/// # Scenario
/// Rollback after staging writes.
///
/// # Expected behavior
/// Nothing reaches the table; a later transaction sees no trace.
#[test]
fn rollback_discards_staged_writes() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"ghost", b"value").unwrap();
    tx.rollback();

    let tx = db.begin_tx("main").unwrap();
    assert_eq!(tx.get(b"ghost").unwrap(), None);
    tx.rollback();

    db.close().unwrap();
    assert_eq!(segment_file_count(dir.path()), 0);
}

// ================================================================================================
// Scans
// ================================================================================================

/// # Scenario
/// Three staged keys, scan from `mykey2` unbounded above.
///
/// # Expected behavior
/// Yields `mykey2` then `mykey3`, then end-of-iteration.
#[test]
fn bounded_scan_within_transaction() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"mykey", b"myvalue").unwrap();
    tx.put(b"mykey2", b"myvalue2").unwrap();
    tx.put(b"mykey3", b"myvalue3").unwrap();

    let mut iter = tx.lookup(Some(b"mykey2"), None).unwrap();
    assert_eq!(
        iter.next().unwrap().unwrap(),
        (b"mykey2".to_vec(), b"myvalue2".to_vec())
    );
    assert_eq!(
        iter.next().unwrap().unwrap(),
        (b"mykey3".to_vec(), b"myvalue3".to_vec())
    );
    assert!(iter.next().is_none());

    // Upper bound is inclusive.
    let mut iter = tx.lookup(Some(b"mykey2"), Some(b"mykey2")).unwrap();
    assert_eq!(
        iter.next().unwrap().unwrap(),
        (b"mykey2".to_vec(), b"myvalue2".to_vec())
    );
    assert!(iter.next().is_none());

    // A range past every key is empty.
    let mut iter = tx.lookup(Some(b"mykey4"), None).unwrap();
    assert!(iter.next().is_none());

    tx.commit();
    db.close().unwrap();
}

/// # Scenario
/// Scan over a mix of disk segments and staged writes, with deletions on
/// both sides.
///
/// # Expected behavior
/// One ordered, duplicate-free stream of live entries.
#[test]
fn scan_merges_disk_and_staged_entries() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    for key in ["b", "d", "f"] {
        tx.put(key.as_bytes(), b"disk").unwrap();
    }
    tx.commit_sync().unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    tx.put(b"a", b"staged").unwrap();
    tx.put(b"d", b"staged").unwrap();
    tx.remove(b"f").unwrap();
    tx.put(b"g", b"staged").unwrap();

    let entries: Vec<_> = tx
        .lookup(None, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (b"a".to_vec(), b"staged".to_vec()),
        (b"b".to_vec(), b"disk".to_vec()),
        (b"d".to_vec(), b"staged".to_vec()),
        (b"g".to_vec(), b"staged".to_vec()),
    ];
    assert_eq!(entries, expected);

    tx.rollback();
    db.close().unwrap();
}

// ================================================================================================
// Tables
// ================================================================================================

/// # Scenario
/// Two tables written in one database.
///
/// # Expected behavior
/// Tables are independent LSMs: keys do not leak between them, and each
/// merges to its own single segment pair.
#[test]
fn tables_are_independent() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("users").unwrap();
    tx.put(b"alice", b"1").unwrap();
    tx.commit_sync().unwrap();

    let mut tx = db.begin_tx("orders").unwrap();
    tx.put(b"order-9", b"alice").unwrap();
    tx.commit_sync().unwrap();

    let tx = db.begin_tx("users").unwrap();
    assert_eq!(tx.get(b"order-9").unwrap(), None);
    assert_eq!(tx.get(b"alice").unwrap(), Some(b"1".to_vec()));
    tx.rollback();

    db.close_with_merge(1).unwrap();
    // One keys+data pair per table.
    assert_eq!(segment_file_count(dir.path()), 4);
}

// ================================================================================================
// Concurrency
// ================================================================================================

/// # Scenario
/// Six threads, each committing distinct keys to the same table.
///
/// # Expected behavior
/// Every committed key is readable afterwards; commits serialize through
/// the segment list without loss.
#[test]
fn parallel_writers_on_one_table() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut handles = Vec::new();
    for worker in 0..6 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..12 {
                let mut tx = db.begin_tx("main").unwrap();
                tx.put(
                    format!("w{worker}-key{i:03}").as_bytes(),
                    format!("w{worker}-value{i:03}").as_bytes(),
                )
                .unwrap();
                tx.commit_sync().unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let entries = scan_all(&db, "main");
    assert_eq!(entries.len(), 6 * 12);

    let tx = db.begin_tx("main").unwrap();
    for worker in 0..6 {
        for i in 0..12 {
            assert_eq!(
                tx.get(format!("w{worker}-key{i:03}").as_bytes()).unwrap(),
                Some(format!("w{worker}-value{i:03}").into_bytes())
            );
        }
    }
    tx.rollback();
    db.close().unwrap();
}

/// # Scenario
/// Writers on distinct tables in parallel, then reopen and verify.
///
/// # Expected behavior
/// No cross-table interference; all data durable.
#[test]
fn parallel_writers_on_distinct_tables() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            let table = format!("table-{worker}");
            for i in 0..25 {
                let mut tx = db.begin_tx(&table).unwrap();
                tx.put(format!("key{i:03}").as_bytes(), table.as_bytes())
                    .unwrap();
                tx.commit();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    db.close().unwrap();

    let db = Database::open(dir.path(), false).unwrap();
    for worker in 0..4 {
        let table = format!("table-{worker}");
        let entries = scan_all(&db, &table);
        assert_eq!(entries.len(), 25, "table {table} incomplete");
        assert!(entries.iter().all(|(_, value)| value == table.as_bytes()));
    }
    db.close().unwrap();
}

// ================================================================================================
// Bulk / stress
// ================================================================================================

/// # Scenario
/// 10,000 fixed-width keys in one transaction, bounded range scans.
///
/// # Expected behavior
/// Full scan yields every entry in lexicographic order; a half-range scan
/// yields exactly half.
#[test]
fn bulk_ordered_scan() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let mut tx = db.begin_tx("main").unwrap();
    for i in 0..10_000u32 {
        tx.put(
            format!("{i:07}.........").as_bytes(),
            format!("payload-{i:07}").as_bytes(),
        )
        .unwrap();
    }
    tx.commit_sync().unwrap();
    db.close_with_merge(1).unwrap();

    let db = Database::open(dir.path(), false).unwrap();
    let entries = scan_all(&db, "main");
    assert_eq!(entries.len(), 10_000);
    for window in entries.windows(2) {
        assert!(window[0].0 < window[1].0);
    }

    let tx = db.begin_tx("main").unwrap();
    let half = tx
        .lookup(
            Some(b"0002500........."),
            Some(b"0007499........."),
        )
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(half.len(), 5_000);
    tx.rollback();
    db.close().unwrap();
}

/// # Scenario
/// One million 16-byte keys with 100-byte values, full and half scans.
///
/// Ignored by default — takes minutes; run with `--ignored` for the full
/// sweep.
#[test]
#[ignore]
fn million_key_sweep() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    let value = [0xABu8; 100];
    let mut tx = db.begin_tx("main").unwrap();
    for i in 0..1_000_000u32 {
        tx.put(format!("{i:07}.........").as_bytes(), &value).unwrap();
    }
    tx.commit_sync().unwrap();
    db.close_with_merge(1).unwrap();

    let db = Database::open(dir.path(), false).unwrap();
    let tx = db.begin_tx("main").unwrap();

    let mut count = 0u64;
    let mut previous: Option<Vec<u8>> = None;
    for entry in tx.lookup(None, None).unwrap() {
        let (key, _) = entry.unwrap();
        if let Some(previous) = &previous {
            assert!(previous < &key);
        }
        previous = Some(key);
        count += 1;
    }
    assert_eq!(count, 1_000_000);

    let half = tx
        .lookup(
            Some(b"0300000........."),
            Some(b"0799999........."),
        )
        .unwrap()
        .count();
    assert_eq!(half, 500_000);

    tx.rollback();
    db.close().unwrap();
}

// ================================================================================================
// Lifecycle edges
// ================================================================================================

/// # Scenario
/// `close_with_merge(0)` must skip the final merge entirely.
///
/// # Expected behavior
/// The per-commit segments are all still on disk after close.
#[test]
fn close_with_merge_zero_skips_merging() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    for i in 0..5 {
        let mut tx = db.begin_tx("main").unwrap();
        tx.put(format!("key{i}").as_bytes(), b"value").unwrap();
        tx.commit_sync().unwrap();
    }
    db.close_with_merge(0).unwrap();

    assert_eq!(segment_file_count(dir.path()), 10);

    // And they are all read back on reopen.
    let db = Database::open(dir.path(), false).unwrap();
    assert_eq!(scan_all(&db, "main").len(), 5);
    db.close().unwrap();
}

/// # Scenario
/// Asynchronous commits followed immediately by close.
///
/// # Expected behavior
/// Close drains the in-flight writers; nothing is lost.
#[test]
fn close_waits_for_async_writers() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path(), true).unwrap();

    for i in 0..50 {
        let mut tx = db.begin_tx("main").unwrap();
        tx.put(format!("key{i:02}").as_bytes(), b"value").unwrap();
        tx.commit();
    }
    db.close().unwrap();

    let db = Database::open(dir.path(), false).unwrap();
    assert_eq!(scan_all(&db, "main").len(), 50);
    db.close().unwrap();
}
