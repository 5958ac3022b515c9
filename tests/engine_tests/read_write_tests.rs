//! Tests for engine reads and writes
//!
//! These tests verify:
//! - Basic put/get/delete operations
//! - Range deletions and merges across memtables
//! - Batched reads and the value-size soft limit
//! - Snapshot reads and snapshot bookkeeping
//! - In-place updates through the update callback
//! - Memtable switching and concurrent writers

use std::sync::Arc;
use std::thread;

use kestrelkv::memtable::UpdateStatus;
use kestrelkv::merge_operator::{StringAppendOperator, UInt64AddOperator};
use kestrelkv::{Config, Engine, KestrelError, ReadOptions, WriteBatch, DEFAULT_COLUMN_FAMILY};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_engine() -> Engine {
    Engine::new(Config::default()).unwrap()
}

fn counter_engine() -> Engine {
    let config = Config::builder()
        .merge_operator(Arc::new(UInt64AddOperator))
        .build();
    Engine::new(config).unwrap()
}

fn u64_bytes(n: u64) -> Vec<u8> {
    n.to_le_bytes().to_vec()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_put_get_delete() {
    let engine = setup_engine();
    assert_eq!(engine.get(b"k").unwrap(), None);

    engine.put(b"k", b"v1").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v1".to_vec()));
    engine.put(b"k", b"v2").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));

    engine.delete(b"k").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), None);
    assert_eq!(engine.latest_sequence(), 3);
}

#[test]
fn test_single_delete_hides_value() {
    let engine = setup_engine();
    engine.put(b"k", b"v").unwrap();
    engine.single_delete(b"k").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), None);
}

#[test]
fn test_empty_values_and_keys() {
    let engine = setup_engine();
    engine.put(b"", b"empty key").unwrap();
    engine.put(b"k", b"").unwrap();
    assert_eq!(engine.get(b"").unwrap(), Some(b"empty key".to_vec()));
    assert_eq!(engine.get(b"k").unwrap(), Some(Vec::new()));
}

#[test]
fn test_write_batch_is_atomic_and_sequenced() {
    let engine = setup_engine();
    engine.put(b"c", b"old").unwrap();

    let mut batch = WriteBatch::new();
    batch.put(DEFAULT_COLUMN_FAMILY, b"a", b"1");
    batch.put(DEFAULT_COLUMN_FAMILY, b"b", b"2");
    batch.delete(DEFAULT_COLUMN_FAMILY, b"c");
    batch.put(DEFAULT_COLUMN_FAMILY, b"a", b"3");
    engine.write(&batch).unwrap();

    // one sequence per operation
    assert_eq!(engine.latest_sequence(), 5);
    assert_eq!(engine.get(b"a").unwrap(), Some(b"3".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.get(b"c").unwrap(), None);

    // the batch is invisible just before its first sequence
    let before = ReadOptions::at(1);
    assert_eq!(engine.get_cf(&before, DEFAULT_COLUMN_FAMILY, b"a").unwrap(), None);
    assert_eq!(
        engine.get_cf(&before, DEFAULT_COLUMN_FAMILY, b"c").unwrap(),
        Some(b"old".to_vec())
    );
}

#[test]
fn test_empty_batch_is_noop() {
    let engine = setup_engine();
    engine.write(&WriteBatch::new()).unwrap();
    assert_eq!(engine.latest_sequence(), 0);
}

#[test]
fn test_unknown_column_family_is_rejected() {
    let engine = setup_engine();
    assert!(matches!(
        engine.put_cf(7, b"k", b"v"),
        Err(KestrelError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.get_cf(&ReadOptions::default(), 7, b"k"),
        Err(KestrelError::InvalidArgument(_))
    ));
    assert_eq!(engine.latest_sequence(), 0);
}

// =============================================================================
// Range Deletion Tests
// =============================================================================

#[test]
fn test_delete_range_covers_half_open_interval() {
    let engine = setup_engine();
    for key in [b"a", b"b", b"c", b"d"] {
        engine.put(key, key).unwrap();
    }
    engine.delete_range(DEFAULT_COLUMN_FAMILY, b"b", b"d").unwrap();

    assert_eq!(engine.get(b"a").unwrap(), Some(b"a".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), None);
    assert_eq!(engine.get(b"c").unwrap(), None);
    assert_eq!(engine.get(b"d").unwrap(), Some(b"d".to_vec()));

    // newer writes inside the range are visible again
    engine.put(b"c", b"back").unwrap();
    assert_eq!(engine.get(b"c").unwrap(), Some(b"back".to_vec()));
}

#[test]
fn test_delete_range_in_newer_memtable_hides_older_values() {
    let engine = setup_engine();
    engine.put(b"k1", b"v").unwrap();
    engine.put(b"k2", b"v").unwrap();
    engine.switch_memtable(DEFAULT_COLUMN_FAMILY).unwrap();
    engine.delete_range(DEFAULT_COLUMN_FAMILY, b"k", b"l").unwrap();

    assert_eq!(engine.get(b"k1").unwrap(), None);
    let results = engine
        .multi_get(&ReadOptions::default(), DEFAULT_COLUMN_FAMILY, &[b"k1", b"k2"])
        .unwrap();
    assert!(results.iter().all(|r| matches!(r, Ok(None))));
}

#[test]
fn test_delete_range_rejects_inverted_bounds() {
    let engine = setup_engine();
    assert!(matches!(
        engine.delete_range(DEFAULT_COLUMN_FAMILY, b"z", b"a"),
        Err(KestrelError::InvalidArgument(_))
    ));
    // an empty range is accepted and deletes nothing
    engine.put(b"m", b"v").unwrap();
    engine.delete_range(DEFAULT_COLUMN_FAMILY, b"m", b"m").unwrap();
    assert_eq!(engine.get(b"m").unwrap(), Some(b"v".to_vec()));
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_merge_counter_across_memtables() {
    let engine = counter_engine();
    engine.merge(b"n", &u64_bytes(1)).unwrap();
    engine.merge(b"n", &u64_bytes(2)).unwrap();
    engine.switch_memtable(DEFAULT_COLUMN_FAMILY).unwrap();
    engine.merge(b"n", &u64_bytes(3)).unwrap();

    assert_eq!(engine.get(b"n").unwrap(), Some(u64_bytes(6)));
    assert_eq!(
        engine.get_cf(&ReadOptions::at(2), DEFAULT_COLUMN_FAMILY, b"n").unwrap(),
        Some(u64_bytes(3))
    );
}

#[test]
fn test_merge_stops_at_put_and_delete() {
    let engine = counter_engine();
    engine.put(b"n", &u64_bytes(100)).unwrap();
    engine.merge(b"n", &u64_bytes(5)).unwrap();
    assert_eq!(engine.get(b"n").unwrap(), Some(u64_bytes(105)));

    engine.delete(b"n").unwrap();
    engine.merge(b"n", &u64_bytes(7)).unwrap();
    assert_eq!(engine.get(b"n").unwrap(), Some(u64_bytes(7)));
}

#[test]
fn test_merge_without_operator_is_not_supported() {
    let engine = setup_engine();
    engine.merge(b"k", b"x").unwrap();
    assert!(engine.get(b"k").is_err());
}

#[test]
fn test_string_append_merge() {
    let config = Config::builder()
        .merge_operator(Arc::new(StringAppendOperator::new(b',')))
        .build();
    let engine: Engine = Engine::new(config).unwrap();
    engine.put(b"list", b"a").unwrap();
    engine.merge(b"list", b"b").unwrap();
    engine.merge(b"list", b"c").unwrap();
    assert_eq!(engine.get(b"list").unwrap(), Some(b"a,b,c".to_vec()));
}

// =============================================================================
// Multi-Get Tests
// =============================================================================

#[test]
fn test_multi_get_matches_point_reads() {
    let engine = setup_engine();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    engine.switch_memtable(DEFAULT_COLUMN_FAMILY).unwrap();
    engine.delete(b"b").unwrap();
    engine.put(b"c", b"3").unwrap();

    let keys: [&[u8]; 4] = [b"a", b"b", b"c", b"zz"];
    let results = engine
        .multi_get(&ReadOptions::default(), DEFAULT_COLUMN_FAMILY, &keys)
        .unwrap();
    let expected: Vec<Option<Vec<u8>>> = keys.iter().map(|k| engine.get(k).unwrap()).collect();
    let got: Vec<Option<Vec<u8>>> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(got, expected);
    assert_eq!(got, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec()), None]);
}

#[test]
fn test_multi_get_soft_limit_aborts_remaining_keys() {
    let engine = setup_engine();
    let big = vec![b'x'; 100];
    for key in [b"a", b"b", b"c", b"d"] {
        engine.put(key, &big).unwrap();
    }

    let opts = ReadOptions {
        value_size_soft_limit: 150,
        ..ReadOptions::default()
    };
    let keys: [&[u8]; 4] = [b"a", b"b", b"c", b"d"];
    let results = engine.multi_get(&opts, DEFAULT_COLUMN_FAMILY, &keys).unwrap();
    assert_eq!(results[0], Ok(Some(big.clone())));
    assert_eq!(results[1], Ok(Some(big)));
    assert!(matches!(results[2], Err(KestrelError::Aborted(_))));
    assert!(matches!(results[3], Err(KestrelError::Aborted(_))));
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_snapshot_reads_are_stable() {
    let engine = setup_engine();
    engine.put(b"k", b"v1").unwrap();
    let snap = engine.snapshot();
    engine.put(b"k", b"v2").unwrap();
    engine.delete(b"gone").unwrap();

    let opts = snap.read_options();
    assert_eq!(
        engine.get_cf(&opts, DEFAULT_COLUMN_FAMILY, b"k").unwrap(),
        Some(b"v1".to_vec())
    );
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn test_snapshot_bookkeeping() {
    let engine = setup_engine();
    assert_eq!(engine.oldest_snapshot(), None);

    let s0 = engine.snapshot();
    engine.put(b"k", b"v").unwrap();
    let s1 = engine.snapshot();
    let s1_again = engine.snapshot();
    assert_eq!(s0.sequence(), 0);
    assert_eq!(s1.sequence(), 1);
    assert_eq!(engine.num_snapshots(), 3);
    assert_eq!(engine.oldest_snapshot(), Some(0));

    drop(s0);
    assert_eq!(engine.oldest_snapshot(), Some(1));
    drop(s1);
    assert_eq!(engine.num_snapshots(), 1);
    drop(s1_again);
    assert_eq!(engine.oldest_snapshot(), None);
}

// =============================================================================
// In-place Update Tests
// =============================================================================

#[test]
fn test_inplace_update_overwrites_latest_value() {
    let config = Config::builder().inplace_update_support(true, 16).build();
    let engine: Engine = Engine::new(config).unwrap();
    engine.put(b"k", b"longer-value").unwrap();
    engine.put(b"k", b"short").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"short".to_vec()));

    let cf = engine.column_family(DEFAULT_COLUMN_FAMILY).unwrap();
    // the second put was absorbed by the first entry
    assert_eq!(cf.active_memtable().num_entries(), 1);

    engine.put(b"k", b"a value that no longer fits").unwrap();
    assert_eq!(
        engine.get(b"k").unwrap(),
        Some(b"a value that no longer fits".to_vec())
    );
    assert_eq!(cf.active_memtable().num_entries(), 2);
}

#[test]
fn test_inplace_callback_accumulates() {
    let config = Config::builder()
        .inplace_update_support(true, 16)
        .inplace_callback(Arc::new(|existing: Option<&[u8]>, delta: &[u8]| {
            let add = u64::from_le_bytes(delta.try_into().unwrap_or([0; 8]));
            match existing {
                None => UpdateStatus::Updated(delta.to_vec()),
                Some(cur) => {
                    let base = u64::from_le_bytes(cur.try_into().unwrap_or([0; 8]));
                    UpdateStatus::UpdatedInPlace((base + add).to_le_bytes().to_vec())
                }
            }
        }))
        .build();
    let engine: Engine = Engine::new(config).unwrap();

    engine.put(b"n", &u64_bytes(5)).unwrap();
    engine.put(b"n", &u64_bytes(10)).unwrap();
    assert_eq!(engine.get(b"n").unwrap(), Some(u64_bytes(15)));

    // an older memtable is read through and the result lands in the new one
    engine.switch_memtable(DEFAULT_COLUMN_FAMILY).unwrap();
    engine.put(b"n", &u64_bytes(1)).unwrap();
    assert_eq!(engine.get(b"n").unwrap(), Some(u64_bytes(16)));

    // after a delete the callback sees no value
    engine.delete(b"n").unwrap();
    engine.put(b"n", &u64_bytes(2)).unwrap();
    assert_eq!(engine.get(b"n").unwrap(), Some(u64_bytes(2)));
}

#[test]
fn test_inplace_callback_failure_writes_nothing() {
    let config = Config::builder()
        .inplace_update_support(true, 4)
        .inplace_callback(Arc::new(|existing: Option<&[u8]>, delta: &[u8]| match existing {
            Some(_) => UpdateStatus::Failed,
            None => UpdateStatus::Updated(delta.to_vec()),
        }))
        .build();
    let engine: Engine = Engine::new(config).unwrap();

    engine.put(b"k", b"first").unwrap();
    engine.put(b"k", b"second").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"first".to_vec()));
    // the rejected put still consumed its sequence
    assert_eq!(engine.latest_sequence(), 2);
}

// =============================================================================
// Memtable Switching Tests
// =============================================================================

#[test]
fn test_full_memtable_is_switched_out() {
    let config = Config::builder().write_buffer_size(64 * 1024).build();
    let engine: Engine = Engine::new(config).unwrap();
    let value = vec![b'v'; 1024];
    for i in 0..400u32 {
        engine.put(format!("key{:05}", i).as_bytes(), &value).unwrap();
    }

    let cf = engine.column_family(DEFAULT_COLUMN_FAMILY).unwrap();
    assert!(cf.num_immutable_memtables() > 0);
    for i in (0..400u32).step_by(37) {
        assert_eq!(
            engine.get(format!("key{:05}", i).as_bytes()).unwrap(),
            Some(value.clone())
        );
    }
}

#[test]
fn test_newer_memtable_shadows_older() {
    let engine = setup_engine();
    engine.put(b"k", b"old").unwrap();
    engine.switch_memtable(DEFAULT_COLUMN_FAMILY).unwrap();
    engine.put(b"k", b"new").unwrap();

    assert_eq!(engine.get(b"k").unwrap(), Some(b"new".to_vec()));
    assert_eq!(
        engine.get_cf(&ReadOptions::at(1), DEFAULT_COLUMN_FAMILY, b"k").unwrap(),
        Some(b"old".to_vec())
    );
    let cf = engine.column_family(DEFAULT_COLUMN_FAMILY).unwrap();
    assert_eq!(cf.num_immutable_memtables(), 1);
    assert_eq!(cf.active_memtable().earliest_sequence(), 2);
}

// =============================================================================
// Concurrent Access Tests
// =============================================================================

#[test]
fn test_concurrent_writers_and_readers() {
    let engine = setup_engine();
    let threads = 8;
    let per_thread = 250;

    thread::scope(|s| {
        for t in 0..threads {
            let engine = &engine;
            s.spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{}-{}", t, i);
                    engine.put(key.as_bytes(), key.as_bytes()).unwrap();
                    assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(key.into_bytes()));
                }
            });
        }
    });

    assert_eq!(engine.latest_sequence(), (threads * per_thread) as u64);
    for t in 0..threads {
        let key = format!("t{}-{}", t, per_thread - 1);
        assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(key.into_bytes()));
    }
}

#[test]
fn test_concurrent_writers_same_key_serialize() {
    let engine = setup_engine();
    thread::scope(|s| {
        for t in 0..4u8 {
            let engine = &engine;
            s.spawn(move || {
                for _ in 0..100 {
                    engine.put(b"hot", &[t]).unwrap();
                }
            });
        }
    });
    assert_eq!(engine.latest_sequence(), 400);
    let value = engine.get(b"hot").unwrap().unwrap();
    assert!(value[0] < 4);
}
