//! Integration tests: BarDB through its public handle.
//!
//! These tests open real files, close and reopen them, damage bytes on disk
//! and run several writers at once.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use rand::prelude::*;
use tempfile::TempDir;

use bardb_core::format::{DATA_HEADER_SIZE, MAX_DATA_PAYLOAD};
use bardb_core::{BarDb, BarError, Options, VacuumOutcome, WriteOptions, MAX_VALUE_SIZE, PAGE_SIZE};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_db() -> (BarDb, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = BarDb::open(dir.path().join("test.bar"), Options::no_vacuum()).unwrap();
    (db, dir)
}

fn flip_byte(path: &Path, offset: u64) {
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[!byte[0]]).unwrap();
}

// ---------------------------------------------------------------------------
// Basic Operations
// ---------------------------------------------------------------------------

#[test]
fn test_read_your_durable_write() {
    let (db, _dir) = test_db();
    db.set(10, b"qtplatypus", WriteOptions::DURABLE).unwrap();
    assert_eq!(db.get(10).unwrap(), Some(b"qtplatypus".to_vec()));
    assert_eq!(db.get(11).unwrap(), None);
}

#[test]
fn test_unwritten_keys_absent() {
    let (db, _dir) = test_db();
    for key in [0u32, 1, 0x8000_0000, u32::MAX] {
        assert_eq!(db.get(key).unwrap(), None);
    }
}

#[test]
fn test_overwrite_tiers() {
    let (db, _dir) = test_db();
    db.set(1, b"a", WriteOptions::VOLATILE).unwrap();
    db.set(1, b"b", WriteOptions::DURABLE).unwrap();
    assert_eq!(db.get(1).unwrap(), Some(b"b".to_vec()));
    assert_eq!(db.verify().unwrap().keys, 1);
}

#[test]
fn test_large_values() {
    let (db, _dir) = test_db();
    let mut rng = StdRng::seed_from_u64(7);

    let exact: Vec<u8> = (0..MAX_DATA_PAYLOAD).map(|_| rng.gen()).collect();
    let split: Vec<u8> = (0..MAX_DATA_PAYLOAD + 1).map(|_| rng.gen()).collect();
    let huge: Vec<u8> = (0..MAX_VALUE_SIZE).map(|_| rng.gen()).collect();

    db.set(1, &exact, WriteOptions::VOLATILE).unwrap();
    db.set(2, &split, WriteOptions::VOLATILE).unwrap();
    db.set(3, &huge, WriteOptions::DURABLE).unwrap();

    assert_eq!(db.get(1).unwrap(), Some(exact));
    assert_eq!(db.get(2).unwrap(), Some(split));
    assert_eq!(db.get(3).unwrap(), Some(huge));

    let too_big = vec![0u8; MAX_VALUE_SIZE + 1];
    assert!(matches!(
        db.set(4, &too_big, WriteOptions::DURABLE),
        Err(BarError::OversizedEntry { .. })
    ));
    assert_eq!(db.get(4).unwrap(), None);
}

#[test]
fn test_random_keys_match_model() {
    let (db, _dir) = test_db();
    let mut rng = StdRng::seed_from_u64(0xBA4D_B0);
    let mut model: HashMap<u32, Vec<u8>> = HashMap::new();

    for round in 0..2000u32 {
        // small key space so overwrites happen often
        let key = if rng.gen_bool(0.3) { rng.gen_range(0..64) } else { rng.gen() };
        let len = rng.gen_range(0..64);
        let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let write = if round % 100 == 0 { WriteOptions::DURABLE } else { WriteOptions::VOLATILE };
        db.set(key, &value, write).unwrap();
        model.insert(key, value);
    }

    for (key, value) in &model {
        assert_eq!(db.get(*key).unwrap().as_ref(), Some(value), "key {:08x}", key);
    }
    for _ in 0..1000 {
        let key: u32 = rng.gen();
        assert_eq!(db.get(key).unwrap(), model.get(&key).cloned());
    }

    // every count in the tree still adds up
    let report = db.verify().unwrap();
    assert_eq!(report.keys, model.len() as u64);
    assert!(db.heads().is_ordered());
}

// ---------------------------------------------------------------------------
// Persistence and Recovery
// ---------------------------------------------------------------------------

#[test]
fn test_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reopen.bar");
    {
        let db = BarDb::open(&path, Options::no_vacuum()).unwrap();
        for key in 0..100u32 {
            db.set(key * 7919, format!("value-{}", key).as_bytes(), WriteOptions::DURABLE).unwrap();
        }
        db.close();
    }
    {
        let db = BarDb::open(&path, Options::no_vacuum()).unwrap();
        for key in 0..100u32 {
            assert_eq!(db.get(key * 7919).unwrap(), Some(format!("value-{}", key).into_bytes()));
        }
        assert_eq!(db.verify().unwrap().keys, 100);
    }
}

#[test]
fn test_corrupt_volatile_snapshot_rolls_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corrupt.bar");
    let leaf_at;
    {
        let db = BarDb::open(&path, Options::no_vacuum()).unwrap();
        db.set(1, b"before", WriteOptions::DURABLE).unwrap();
        db.set(2, b"durable-two", WriteOptions::DURABLE).unwrap();

        // the next Set writes its leaf at the current high tide
        leaf_at = db.heads().high_tide;
        db.set(2, b"volatile-two", WriteOptions::VOLATILE).unwrap();
        db.set(3, b"only-volatile", WriteOptions::VOLATILE).unwrap();
        assert_eq!(db.get(2).unwrap(), Some(b"volatile-two".to_vec()));
        db.close();
    }

    flip_byte(&path, leaf_at + DATA_HEADER_SIZE as u64);

    let db = BarDb::open(&path, Options::no_vacuum()).unwrap();
    let heads = db.heads();
    assert_eq!(heads.volatile, heads.durable);
    assert_eq!(db.get(1).unwrap(), Some(b"before".to_vec()));
    assert_eq!(db.get(2).unwrap(), Some(b"durable-two".to_vec()));
    assert_eq!(db.get(3).unwrap(), None);

    // writes continue after the rollback
    db.set(3, b"again", WriteOptions::DURABLE).unwrap();
    assert_eq!(db.get(3).unwrap(), Some(b"again".to_vec()));
    assert_eq!(db.verify().unwrap().keys, 3);
}

#[test]
fn test_foreign_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("foreign.bar");
    let mut page = vec![0u8; PAGE_SIZE as usize];
    page[..8].copy_from_slice(b"\x7fELF\x02\x01\x01\x00");
    std::fs::write(&path, &page).unwrap();

    match BarDb::open(&path, Options::no_vacuum()) {
        Err(BarError::NoMagicFound { .. }) => {}
        Err(other) => panic!("expected NoMagicFound, got {}", other),
        Ok(_) => panic!("foreign file opened"),
    }
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_disjoint_writers() {
    let (db, _dir) = test_db();
    let db = Arc::new(db);

    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(u64::from(t));
                let mut written = Vec::new();
                for _ in 0..100 {
                    // low 3 bits name the thread, so key sets never overlap
                    let key = (rng.gen::<u32>() & !7) | t;
                    db.set(key, &key.to_le_bytes(), WriteOptions::VOLATILE).unwrap();
                    written.push(key);
                }
                written
            })
        })
        .collect();

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    for key in &all {
        assert_eq!(db.get(*key).unwrap(), Some(key.to_le_bytes().to_vec()));
    }

    all.sort_unstable();
    all.dedup();
    assert_eq!(db.verify().unwrap().keys, all.len() as u64);
}

#[test]
fn test_two_handles_share_one_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.bar");
    let first = BarDb::open(&path, Options::no_vacuum()).unwrap();
    let second = BarDb::open(&path, Options::no_vacuum()).unwrap();

    first.set(1, b"from-first", WriteOptions::VOLATILE).unwrap();
    second.set(2, b"from-second", WriteOptions::VOLATILE).unwrap();

    assert_eq!(second.get(1).unwrap(), Some(b"from-first".to_vec()));
    assert_eq!(first.get(2).unwrap(), Some(b"from-second".to_vec()));
    assert_eq!(first.heads(), second.heads());
}

#[test]
fn test_header_ordered_while_writers_commit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("busy.bar");
    let db = Arc::new(BarDb::open(&path, Options::no_vacuum()).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..3u32)
        .map(|t| {
            let db = Arc::clone(&db);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut i = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    db.set(i.wrapping_mul(3) + t, b"busy", WriteOptions::VOLATILE).unwrap();
                    i = i.wrapping_add(1);
                }
            })
        })
        .collect();

    // opening runs the same header check against a moving head
    for _ in 0..20 {
        for _ in 0..10_000 {
            let heads = db.heads();
            assert!(heads.is_ordered(), "{:?}", heads);
        }
        BarDb::open(&path, Options::no_vacuum()).unwrap().close();
    }

    stop.store(true, Ordering::Relaxed);
    for w in writers {
        w.join().unwrap();
    }
    assert!(db.heads().is_ordered());
}

// ---------------------------------------------------------------------------
// Vacuum
// ---------------------------------------------------------------------------

#[test]
fn test_vacuum_then_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vacuum.bar");
    {
        let db = BarDb::open(&path, Options::no_vacuum()).unwrap();
        for round in 0..20u32 {
            for key in 0..20u32 {
                db.set(key, &(round * 100 + key).to_le_bytes(), WriteOptions::VOLATILE).unwrap();
            }
        }

        let before = db.heads();
        let outcome = db.vacuum_now().unwrap();
        let after = db.heads();
        match outcome {
            VacuumOutcome::Reclaimed { snapshot, released, stats, .. } => {
                assert_eq!(snapshot, before.volatile);
                assert!(released > 0);
                assert!(stats.live_bytes < stats.allocated_bytes);
            }
            other => panic!("expected a reclaim, got {:?}", other),
        }
        assert!(after.is_ordered(), "{:?}", after);
        assert!(after.low_tide > before.low_tide);
        assert_eq!(after.vacuum, after.durable);
        assert_eq!(db.vacuum_stats().bytes_reclaimed(), after.low_tide - before.low_tide);

        // writes after the vacuum still work
        db.set(100, b"late", WriteOptions::DURABLE).unwrap();
        db.close();
    }

    let db = BarDb::open(&path, Options::no_vacuum()).unwrap();
    for key in 0..20u32 {
        assert_eq!(db.get(key).unwrap(), Some((1900 + key).to_le_bytes().to_vec()));
    }
    assert_eq!(db.get(100).unwrap(), Some(b"late".to_vec()));
    assert_eq!(db.verify().unwrap().keys, 21);
}

#[test]
fn test_vacuum_during_writes() {
    let (db, _dir) = test_db();
    let db = Arc::new(db);

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..2000u32 {
                db.set(i % 50, &i.to_le_bytes(), WriteOptions::VOLATILE).unwrap();
            }
        })
    };
    let reader = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..2000u32 {
                // readers restart on retired snapshots, never see garbage
                if let Some(v) = db.get(i % 50).unwrap() {
                    assert_eq!(v.len(), 4);
                    assert_eq!(u32::from_le_bytes([v[0], v[1], v[2], v[3]]) % 50, i % 50);
                }
            }
        })
    };

    for _ in 0..20 {
        db.vacuum_now().unwrap();
        assert!(db.heads().is_ordered());
        thread::yield_now();
    }
    writer.join().unwrap();
    reader.join().unwrap();

    for key in 0..50u32 {
        assert_eq!(db.get(key).unwrap(), Some((1950 + key).to_le_bytes().to_vec()));
    }
    assert_eq!(db.verify().unwrap().keys, 50);
}
