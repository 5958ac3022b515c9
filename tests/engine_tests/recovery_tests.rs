//! Tests for rebuilding an engine from its log
//!
//! These tests verify:
//! - Plain writes, column families and sequences survive recovery
//! - Prepared transactions are applied, dropped or left pending per their markers
//! - Pending prepared transactions stay locked until resolved
//! - A damaged tail is dropped and the log stays recoverable afterwards

use std::sync::Arc;
use std::time::Duration;

use kestrelkv::merge_operator::UInt64AddOperator;
use kestrelkv::wal::{Durability, LogRecovery, LogSegment};
use kestrelkv::{
    Config, Engine, KestrelError, ReadOptions, TransactionOptions, WriteBatch, DEFAULT_COLUMN_FAMILY,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn config() -> Config {
    Config::builder()
        .default_lock_timeout(Duration::from_millis(20))
        .max_log_segment_size(256)
        .build()
}

fn recover(segments: Vec<LogSegment>) -> Engine {
    Engine::recover(config(), segments).unwrap()
}

fn two_phase() -> TransactionOptions {
    TransactionOptions {
        skip_prepare: false,
        ..TransactionOptions::default()
    }
}

fn prepare_named(engine: &Engine, name: &str, key: &[u8], value: &[u8]) {
    let mut txn = engine.begin_transaction(&two_phase());
    txn.set_name(name).unwrap();
    txn.put(key, value).unwrap();
    txn.prepare().unwrap();
    // left prepared: the engine keeps it pending after the handle drops
}

// =============================================================================
// Plain Write Tests
// =============================================================================

#[test]
fn test_recover_empty_log() {
    let engine: Engine = Engine::new(config()).unwrap();
    let recovered = recover(engine.log_segments());
    assert_eq!(recovered.latest_sequence(), 0);
    assert_eq!(recovered.get(b"k").unwrap(), None);
    recovered.put(b"k", b"v").unwrap();
    assert_eq!(recovered.latest_sequence(), 1);
}

#[test]
fn test_recover_restores_data_and_sequence() {
    let engine: Engine = Engine::new(config()).unwrap();
    for i in 0..50u32 {
        engine
            .put(format!("key{:03}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }
    engine.delete(b"key007").unwrap();
    engine.delete_range(DEFAULT_COLUMN_FAMILY, b"key040", b"key045").unwrap();
    let mut batch = WriteBatch::new();
    batch.put(DEFAULT_COLUMN_FAMILY, b"batch-a", b"1");
    batch.put(DEFAULT_COLUMN_FAMILY, b"batch-b", b"2");
    engine.write(&batch).unwrap();
    assert!(engine.log_segments().len() > 1);

    let recovered = recover(engine.log_segments());
    assert_eq!(recovered.latest_sequence(), engine.latest_sequence());
    for key in ["key000", "key007", "key039", "key040", "key044", "key045", "batch-b"] {
        assert_eq!(
            recovered.get(key.as_bytes()).unwrap(),
            engine.get(key.as_bytes()).unwrap(),
            "key {}",
            key
        );
    }
    assert_eq!(recovered.get(b"key007").unwrap(), None);
    assert_eq!(recovered.get(b"key044").unwrap(), None);

    // snapshot reads below the recovered sequence still work
    let at = ReadOptions::at(8);
    assert_eq!(
        recovered.get_cf(&at, DEFAULT_COLUMN_FAMILY, b"key007").unwrap(),
        Some(b"v7".to_vec())
    );
}

#[test]
fn test_recover_merges() {
    let config = Config::builder()
        .merge_operator(Arc::new(UInt64AddOperator))
        .build();
    let engine: Engine = Engine::new(config.clone()).unwrap();
    for n in 1..=4u64 {
        engine.merge(b"sum", &n.to_le_bytes()).unwrap();
    }
    let recovered: Engine = Engine::recover(config, engine.log_segments()).unwrap();
    assert_eq!(recovered.get(b"sum").unwrap(), Some(10u64.to_le_bytes().to_vec()));
}

#[test]
fn test_recover_column_families() {
    let engine: Engine = Engine::new(config()).unwrap();
    let users = engine.create_column_family("users").unwrap();
    engine.put_cf(users, b"alice", b"1").unwrap();
    engine.put(b"alice", b"default").unwrap();

    let recovered = recover(engine.log_segments());
    assert_eq!(recovered.column_family_id("users"), Some(users));
    assert_eq!(
        recovered.get_cf(&ReadOptions::default(), users, b"alice").unwrap(),
        Some(b"1".to_vec())
    );
    assert_eq!(recovered.get(b"alice").unwrap(), Some(b"default".to_vec()));

    // the next column family does not reuse the recovered id
    let orders = recovered.create_column_family("orders").unwrap();
    assert!(orders > users);
}

#[test]
fn test_recover_twice_keeps_new_writes() {
    let engine: Engine = Engine::new(config()).unwrap();
    engine.put(b"a", b"1").unwrap();

    let second = recover(engine.log_segments());
    second.put(b"b", b"2").unwrap();
    let third = recover(second.log_segments());

    assert_eq!(third.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(third.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(third.latest_sequence(), 2);
}

// =============================================================================
// Damaged Log Tests
// =============================================================================

#[test]
fn test_torn_tail_is_dropped_and_log_heals() {
    let engine: Engine = Engine::new(config()).unwrap();
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();

    let mut segments = engine.log_segments();
    let last = segments.iter().rposition(|s| !s.data.is_empty()).unwrap();
    let len = segments[last].data.len();
    segments[last].data.truncate(len - 1);
    segments.truncate(last + 1);

    let recovered = recover(segments);
    assert_eq!(recovered.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(recovered.get(b"b").unwrap(), None);
    assert_eq!(recovered.latest_sequence(), 1);

    // the rewritten log holds no damage, so later writes survive the next recovery
    recovered.put(b"c", b"3").unwrap();
    assert!(!LogRecovery::verify(&recovered.log_segments()).was_truncated);
    let again = recover(recovered.log_segments());
    assert_eq!(again.get(b"c").unwrap(), Some(b"3".to_vec()));
    assert_eq!(again.latest_sequence(), 2);
}

// =============================================================================
// Two-phase Recovery Tests
// =============================================================================

#[test]
fn test_committed_and_rolled_back_sections_are_resolved() {
    let engine: Engine = Engine::new(config()).unwrap();

    let mut committed = engine.begin_transaction(&two_phase());
    committed.set_name("committed").unwrap();
    committed.put(b"c", b"yes").unwrap();
    committed.prepare().unwrap();
    committed
        .commit_time_batch_mut()
        .put(DEFAULT_COLUMN_FAMILY, b"c-meta", b"1");
    committed.commit().unwrap();

    let mut aborted = engine.begin_transaction(&two_phase());
    aborted.set_name("aborted").unwrap();
    aborted.put(b"r", b"no").unwrap();
    aborted.prepare().unwrap();
    aborted.rollback().unwrap();

    let recovered = recover(engine.log_segments());
    assert!(recovered.recovered_prepared_names().is_empty());
    assert_eq!(recovered.get(b"c").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(recovered.get(b"c-meta").unwrap(), Some(b"1".to_vec()));
    assert_eq!(recovered.get(b"r").unwrap(), None);
    assert_eq!(recovered.latest_sequence(), engine.latest_sequence());
}

#[test]
fn test_pending_prepared_transaction_stays_locked() {
    let engine: Engine = Engine::new(config()).unwrap();
    engine.put(b"before", b"1").unwrap();
    prepare_named(&engine, "xid-b", b"k2", b"v2");
    prepare_named(&engine, "xid-a", b"k1", b"v1");

    let recovered = recover(engine.log_segments());
    assert_eq!(recovered.recovered_prepared_names(), vec!["xid-a", "xid-b"]);
    assert!(recovered.registry().is_name_registered("xid-a"));
    assert_eq!(recovered.get(b"k1").unwrap(), None);
    assert_eq!(recovered.put(b"k1", b"other"), Err(KestrelError::LockTimeout));
    // its log segment is kept for the unresolved section
    assert!(recovered.log().min_log_containing_prepared().is_some());

    // a new transaction cannot reuse the name
    let mut txn = recovered.begin_transaction(&two_phase());
    assert!(txn.set_name("xid-a").is_err());
}

#[test]
fn test_commit_recovered_applies_and_unlocks() {
    let engine: Engine = Engine::new(config()).unwrap();
    prepare_named(&engine, "xid", b"k", b"v");

    let recovered = recover(engine.log_segments());
    let before = recovered.latest_sequence();
    recovered.commit_recovered("xid").unwrap();

    assert_eq!(recovered.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(recovered.latest_sequence(), before + 1);
    assert!(recovered.recovered_prepared_names().is_empty());
    assert!(!recovered.registry().is_name_registered("xid"));
    assert_eq!(recovered.log().min_log_containing_prepared(), None);
    recovered.put(b"k", b"after").unwrap();

    assert_eq!(recovered.commit_recovered("xid"), Err(KestrelError::NotFound));

    // the commit marker makes the next recovery apply it directly
    let again = recover(recovered.log_segments());
    assert!(again.recovered_prepared_names().is_empty());
    assert_eq!(again.get(b"k").unwrap(), Some(b"after".to_vec()));
}

#[test]
fn test_rollback_recovered_discards_and_unlocks() {
    let engine: Engine = Engine::new(config()).unwrap();
    prepare_named(&engine, "xid", b"k", b"v");

    let recovered = recover(engine.log_segments());
    recovered.rollback_recovered("xid").unwrap();
    assert_eq!(recovered.get(b"k").unwrap(), None);
    recovered.put(b"k", b"free").unwrap();
    assert_eq!(recovered.rollback_recovered("xid"), Err(KestrelError::NotFound));

    let again = recover(recovered.log_segments());
    assert!(again.recovered_prepared_names().is_empty());
    assert_eq!(again.get(b"k").unwrap(), Some(b"free".to_vec()));
}
