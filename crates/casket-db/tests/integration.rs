//! Integration tests: the `Db` handle end to end over every backend.
//!
//! These tests exercise open paths, point operations, visitors, cursors,
//! transactions, snapshots and merges, plus multi-threaded workloads and
//! crash recovery from the write-ahead log.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use casket_db::{Config, Db, ErrorKind, FnVisitor, MergeMode, OpenMode, VisitOutcome};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Every open path flavour, file ones rooted in `dir`.
fn all_paths(dir: &Path) -> Vec<String> {
    let mut paths: Vec<String> = [":", "*", "%", "+"].iter().map(|p| p.to_string()).collect();
    for name in ["store.kch", "store.kct", "store.kcd", "store.kcf"] {
        paths.push(dir.join(name).to_string_lossy().into_owned());
    }
    paths
}

fn file_paths(dir: &Path) -> Vec<String> {
    all_paths(dir).into_iter().skip(4).collect()
}

fn open(path: &str) -> Db {
    let db = Db::new();
    db.open(path, OpenMode::default()).unwrap();
    db
}

/// Handle that skips the file lock, so a leaked handle can stand in for a crash.
fn open_unlocked(path: &str) -> Db {
    let db = Db::new();
    db.open(path, OpenMode::default() | OpenMode::NO_LOCK).unwrap();
    db
}

/// Drop the handle without closing it: no checkpoint, WAL left as is.
fn crash(db: Db) {
    std::mem::forget(db);
}

fn records(db: &Db) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut all = BTreeMap::new();
    db.each(|key, value| {
        all.insert(key.to_vec(), value.to_vec());
    })
    .unwrap();
    all
}

// ---------------------------------------------------------------------------
// Open paths and modes
// ---------------------------------------------------------------------------

#[test]
fn test_hello_world_on_every_backend() {
    let dir = TempDir::new().unwrap();
    for path in all_paths(dir.path()) {
        let db = open(&path);
        db.set(b"hello", b"world").unwrap();
        assert_eq!(db.count().unwrap(), 1, "{}", path);
        assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
        db.append(b"hello", b"wide").unwrap();
        assert_eq!(db.get(b"hello").unwrap(), Some(b"worldwide".to_vec()));
        db.remove(b"hello").unwrap();
        assert_eq!(db.get(b"hello").unwrap(), None);
        db.close().unwrap();
    }
}

#[test]
fn test_open_failures() {
    let dir = TempDir::new().unwrap();
    let db = Db::new();

    let unknown = dir.path().join("store.sqlite");
    let err = db.open(unknown.to_str().unwrap(), OpenMode::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OpenFailed);

    let err = db.open(":", OpenMode::READER | OpenMode::CREATE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);

    let missing = dir.path().join("missing.kch");
    let err = db.open(missing.to_str().unwrap(), OpenMode::WRITER).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OpenFailed);
    assert!(!missing.exists());

    assert!(!db.is_open());
}

#[test]
fn test_file_stores_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    for path in file_paths(dir.path()) {
        {
            let db = open(&path);
            for i in 0..200u32 {
                db.set(format!("key-{:04}", i).as_bytes(), &i.to_be_bytes()).unwrap();
            }
            db.remove(b"key-0007").unwrap();
            db.close().unwrap();
        }
        let db = open(&path);
        assert_eq!(db.count().unwrap(), 199, "{}", path);
        assert_eq!(db.get(b"key-0100").unwrap(), Some(100u32.to_be_bytes().to_vec()));
        assert_eq!(db.get(b"key-0007").unwrap(), None);
    }
    assert!(dir.path().join("store.kcd").is_dir());
    assert!(dir.path().join("store.kcf").is_dir());
}

#[test]
fn test_truncate_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trunc.kct");
    let path = path.to_str().unwrap();
    {
        let db = open(path);
        db.set(b"old", b"record").unwrap();
    }
    let db = Db::new();
    db.open(path, OpenMode::default() | OpenMode::TRUNCATE).unwrap();
    assert_eq!(db.count().unwrap(), 0);
}

#[test]
fn test_try_lock_conflict() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locked.kch");
    let path = path.to_str().unwrap();
    let _holder = open(path);

    let second = Db::new();
    let err = second.open(path, OpenMode::default() | OpenMode::TRY_LOCK).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OpenFailed);
}

#[test]
fn test_reader_sees_records_but_cannot_write() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.kct");
    let path = path.to_str().unwrap();
    {
        let db = open(path);
        db.set(b"a", b"1").unwrap();
    }
    let reader = Db::new();
    reader.open(path, OpenMode::READER).unwrap();
    assert_eq!(reader.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(reader.set(b"b", b"2").unwrap_err().kind(), ErrorKind::NoPermission);
    assert_eq!(reader.begin_transaction(false).unwrap_err().kind(), ErrorKind::NoPermission);
    let mut cursor = reader.cursor().unwrap();
    cursor.jump(None).unwrap();
    assert_eq!(cursor.remove().unwrap_err().kind(), ErrorKind::NoPermission);
}

// ---------------------------------------------------------------------------
// Record properties
// ---------------------------------------------------------------------------

#[test]
fn test_missing_get_leaves_count() {
    let db = open("%");
    db.set(b"present", b"x").unwrap();
    for i in 0..50 {
        assert_eq!(db.get(format!("absent-{}", i).as_bytes()).unwrap(), None);
    }
    assert_eq!(db.count().unwrap(), 1);
}

#[test]
fn test_add_and_cas_leave_store_unchanged_on_failure() {
    let db = open(":");
    db.set(b"k", b"original").unwrap();

    assert_eq!(db.add(b"k", b"other").unwrap_err().kind(), ErrorKind::DuplicateRecord);
    assert_eq!(db.get(b"k").unwrap(), Some(b"original".to_vec()));

    assert_eq!(db.cas(b"k", Some(b"wrong"), Some(b"new")).unwrap_err().kind(), ErrorKind::Logic);
    assert_eq!(db.get(b"k").unwrap(), Some(b"original".to_vec()));
    assert_eq!(db.count().unwrap(), 1);

    db.cas(b"k", Some(b"original"), Some(b"new")).unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(b"new".to_vec()));
}

#[test]
fn test_increment_from_origin_and_existing() {
    let db = open("%");
    assert_eq!(db.increment(b"counter", 7, 100).unwrap(), 107);
    assert_eq!(db.increment(b"counter", 3, 100).unwrap(), 110);
    assert_eq!(db.get(b"counter").unwrap(), Some(110i64.to_be_bytes().to_vec()));
}

#[test]
fn test_iterate_removes_every_third_key() {
    for path in [":", "%"] {
        let db = open(path);
        for i in 0..30 {
            db.set(format!("{:02}", i).as_bytes(), b"v").unwrap();
        }
        let mut seen = 0;
        let mut removed = Vec::new();
        let mut visitor = FnVisitor::full(|key: &[u8], _value: &[u8]| {
            seen += 1;
            if seen % 3 == 0 {
                removed.push(key.to_vec());
                VisitOutcome::Remove
            } else {
                VisitOutcome::Nop
            }
        });
        db.iterate(&mut visitor, true).unwrap();
        drop(visitor);

        assert_eq!(removed.len(), 10);
        assert_eq!(db.count().unwrap(), 20);
        for key in &removed {
            assert_eq!(db.get(key).unwrap(), None);
        }
    }
}

#[test]
fn test_accept_bulk_fills_missing_keys() {
    let db = open("%");
    db.set(b"b", b"old").unwrap();
    let mut visitor = FnVisitor::new(
        |_: &[u8], value: &[u8]| VisitOutcome::Replace([value, b"+".as_slice()].concat()),
        |key: &[u8]| VisitOutcome::Replace(key.to_vec()),
    );
    db.accept_bulk(&["a", "b", "c"], &mut visitor, true).unwrap();
    assert_eq!(db.get(b"a").unwrap(), Some(b"a".to_vec()));
    assert_eq!(db.get(b"b").unwrap(), Some(b"old+".to_vec()));
    assert_eq!(db.count().unwrap(), 3);
}

#[test]
fn test_cursor_walks_to_end() {
    let dir = TempDir::new().unwrap();
    for path in all_paths(dir.path()) {
        let db = open(&path);
        let n = 25;
        for i in 0..n {
            db.set(format!("r{}", i).as_bytes(), b"").unwrap();
        }
        let mut cursor = db.cursor().unwrap();
        cursor.jump(None).unwrap();
        for _ in 0..n - 1 {
            cursor.step().unwrap();
        }
        assert_eq!(cursor.step().unwrap_err().kind(), ErrorKind::NotFound, "{}", path);
    }
}

// ---------------------------------------------------------------------------
// Transactions and recovery
// ---------------------------------------------------------------------------

#[test]
fn test_aborted_transaction_restores_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tx.kct");
    let db = open(path.to_str().unwrap());
    for i in 0..10 {
        db.set(format!("k{}", i).as_bytes(), b"before").unwrap();
    }
    let before = records(&db);

    let committed = db
        .transaction(false, |db| {
            db.set(b"k1", b"after")?;
            db.remove(b"k2")?;
            db.set(b"new", b"x")?;
            db.clear()?;
            db.set(b"k3", b"again")?;
            Ok(false)
        })
        .unwrap();
    assert!(!committed);
    assert_eq!(db.count().unwrap(), 10);
    assert_eq!(records(&db), before);

    db.close().unwrap();
    let db = open(path.to_str().unwrap());
    assert_eq!(records(&db), before);
}

#[test]
fn test_recovery_applies_only_committed_work() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.kch");
    let path = path.to_str().unwrap();
    {
        let db = open_unlocked(path);
        db.set(b"plain", b"1").unwrap();
        db.transaction(true, |db| {
            db.set(b"committed", b"yes")?;
            Ok(true)
        })
        .unwrap();
        db.set_bulk(&[("bulk-a", "1"), ("bulk-b", "2")], true).unwrap();
        db.begin_transaction(false).unwrap();
        db.set(b"uncommitted", b"no").unwrap();
        crash(db);
    }
    let db = open_unlocked(path);
    assert_eq!(db.get(b"plain").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(b"committed").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(db.get(b"bulk-b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(db.get(b"uncommitted").unwrap(), None);
    assert_eq!(db.count().unwrap(), 4);
}

#[test]
fn test_auto_transaction_survives_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("auto.kcd");
    let path = path.to_str().unwrap();
    let mode = OpenMode::default() | OpenMode::NO_LOCK | OpenMode::AUTO_TRANSACTION;
    {
        let db = Db::new();
        db.open(path, mode).unwrap();
        for i in 0..20 {
            db.increment(b"n", 1, 0).unwrap();
            db.set(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        crash(db);
    }
    let db = Db::new();
    db.open(path, mode).unwrap();
    assert_eq!(db.increment(b"n", 0, 0).unwrap(), 20);
    assert_eq!(db.count().unwrap(), 21);
}

// ---------------------------------------------------------------------------
// Snapshots and merge
// ---------------------------------------------------------------------------

#[test]
fn test_dump_clear_load_restores_records() {
    let dir = TempDir::new().unwrap();
    let snapshot = dir.path().join("dump.csn");
    for path in [":", "%"] {
        let db = open(path);
        for i in 0..100 {
            db.set(format!("key{}", i).as_bytes(), format!("value{}", i * i).as_bytes()).unwrap();
        }
        let before = records(&db);

        db.dump_snapshot(&snapshot).unwrap();
        db.clear().unwrap();
        assert_eq!(db.count().unwrap(), 0);
        db.load_snapshot(&snapshot).unwrap();

        assert_eq!(db.count().unwrap(), 100);
        assert_eq!(records(&db), before);
    }
}

#[test]
fn test_copy_opens_as_either_file_backend() {
    let dir = TempDir::new().unwrap();
    let source = open("%");
    source.set(b"x", b"1").unwrap();
    source.set(b"y", b"2").unwrap();

    let as_tree = dir.path().join("copy.kct");
    let as_hash = dir.path().join("copy.kch");
    source.copy(&as_tree).unwrap();
    source.copy(&as_hash).unwrap();

    for path in [as_tree, as_hash] {
        let db = open(path.to_str().unwrap());
        assert_eq!(records(&db), records(&source));
    }
}

#[test]
fn test_merge_set_later_source_wins() {
    let a = open(":");
    let b = open("%");
    let target = open("%");
    a.set(b"shared", b"from-a").unwrap();
    a.set(b"only-a", b"a").unwrap();
    b.set(b"shared", b"from-b").unwrap();
    b.set(b"only-b", b"b").unwrap();
    target.set(b"shared", b"from-target").unwrap();

    target.merge(&[&a, &b], MergeMode::Set).unwrap();
    assert_eq!(target.count().unwrap(), 3);
    assert_eq!(target.get(b"shared").unwrap(), Some(b"from-b".to_vec()));
    assert_eq!(target.get(b"only-a").unwrap(), Some(b"a".to_vec()));
    assert_eq!(target.get(b"only-b").unwrap(), Some(b"b".to_vec()));
}

// ---------------------------------------------------------------------------
// Error modes
// ---------------------------------------------------------------------------

#[test]
fn test_status_mode_keeps_last_error() {
    let db = open(":");
    assert!(db.error().is_none());
    db.remove(b"missing").unwrap_err();
    assert_eq!(db.error().map(|e| e.kind()), Some(ErrorKind::NotFound));
    assert_eq!(db.error().map(|e| e.kind().name()), Some("NOREC"));
}

#[test]
fn test_exceptional_mode_reports_through_result_only() {
    let db = Db::with_config(Config::default().exceptional());
    db.open("%", OpenMode::default()).unwrap();
    let err = db.replace(b"missing", b"x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(db.error().is_none());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_increments() {
    let db = open(":");
    let threads = 8;
    let per_thread = 500;
    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                for _ in 0..per_thread {
                    db.increment(b"shared", 1, 0).unwrap();
                }
            });
        }
    });
    assert_eq!(db.increment(b"shared", 0, 0).unwrap(), threads * per_thread);
}

#[test]
fn test_random_mixed_workload_matches_model() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mixed.kch");
    let path = path.to_str().unwrap();
    let db = open(path);
    let threads = 6u64;

    let models: Vec<BTreeMap<Vec<u8>, Vec<u8>>> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let db = &db;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    let mut model = BTreeMap::new();
                    for _ in 0..2_000 {
                        let key = format!("t{}-{}", t, rng.gen_range(0..64)).into_bytes();
                        match rng.gen_range(0..4) {
                            0 | 1 => {
                                let value: Vec<u8> = (0..rng.gen_range(0..32)).map(|_| rng.gen()).collect();
                                db.set(&key, &value).unwrap();
                                model.insert(key, value);
                            }
                            2 => {
                                let expected = model.remove(&key).is_some();
                                assert_eq!(db.remove(&key).is_ok(), expected);
                            }
                            _ => assert_eq!(db.get(&key).unwrap(), model.get(&key).cloned()),
                        }
                    }
                    model
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let expected: BTreeMap<Vec<u8>, Vec<u8>> = models.into_iter().flatten().collect();
    assert_eq!(records(&db), expected);
    db.close().unwrap();

    let db = open(path);
    assert_eq!(records(&db), expected);
}

#[test]
fn test_atomic_bulk_is_never_seen_half_done() {
    let db = open("%");
    let keys = ["left", "middle", "right"];
    db.set_bulk(&keys.map(|k| (k, "0")), true).unwrap();
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            for round in 1..=300 {
                let value = round.to_string();
                let batch: Vec<(&str, &str)> = keys.iter().map(|k| (*k, value.as_str())).collect();
                db.set_bulk(&batch, true).unwrap();
            }
        });
        barrier.wait();
        for _ in 0..300 {
            let snapshot = db.get_bulk(&keys, true).unwrap();
            let values: Vec<&Vec<u8>> = snapshot.values().collect();
            assert_eq!(values.len(), 3);
            assert!(values.iter().all(|v| *v == values[0]), "torn bulk read: {:?}", values);
        }
    });
}

#[test]
fn test_concurrent_mode_point_reads() {
    let db = Db::with_config(Config::default().with_concurrent(true));
    db.open(":", OpenMode::default()).unwrap();
    for i in 0..100 {
        db.set(format!("{}", i).as_bytes(), b"v").unwrap();
    }
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for i in 0..100 {
                    assert!(db.get(format!("{}", i).as_bytes()).unwrap().is_some());
                }
            });
        }
    });
    let mut visitor = FnVisitor::full(|_: &[u8], _: &[u8]| VisitOutcome::Nop);
    assert_eq!(db.iterate(&mut visitor, false).unwrap_err().kind(), ErrorKind::InvalidState);
}

// ---------------------------------------------------------------------------
// Throughput
// ---------------------------------------------------------------------------

#[test]
fn test_tree_file_throughput() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.kct");
    let db = open(path.to_str().unwrap());
    let count = 10_000;

    let start = Instant::now();
    for i in 0..count {
        db.set(format!("key{:08}", i).as_bytes(), &[0xAB; 64]).unwrap();
    }
    let write_time = start.elapsed();

    let start = Instant::now();
    for i in 0..count {
        assert!(db.get(format!("key{:08}", i).as_bytes()).unwrap().is_some());
    }
    let read_time = start.elapsed();

    println!("\n=== Tree File Round-Trip ===");
    println!("  Write {} records: {:?} ({:.0} ops/sec)", count, write_time, count as f64 / write_time.as_secs_f64());
    println!("  Read  {} records: {:?} ({:.0} ops/sec)", count, read_time, count as f64 / read_time.as_secs_f64());
    assert_eq!(db.count().unwrap(), count as u64);
}
