//! Tests for column families
//!
//! These tests verify:
//! - Creation, lookup and duplicate names
//! - Keys are isolated per column family
//! - Batches and transactions spanning several column families

use std::time::Duration;

use kestrelkv::{
    Config, Engine, KestrelError, ReadOptions, TransactionOptions, WriteBatch,
    DEFAULT_COLUMN_FAMILY, DEFAULT_COLUMN_FAMILY_NAME,
};

fn setup_engine() -> Engine {
    Engine::new(Config::default()).unwrap()
}

#[test]
fn test_default_column_family_exists() {
    let engine = setup_engine();
    assert_eq!(
        engine.column_family_id(DEFAULT_COLUMN_FAMILY_NAME),
        Some(DEFAULT_COLUMN_FAMILY)
    );
    let cf = engine.column_family(DEFAULT_COLUMN_FAMILY).unwrap();
    assert_eq!(cf.id(), DEFAULT_COLUMN_FAMILY);
    assert_eq!(cf.name(), "default");
    assert_eq!(cf.num_immutable_memtables(), 0);
}

#[test]
fn test_create_and_lookup() {
    let engine = setup_engine();
    let users = engine.create_column_family("users").unwrap();
    let orders = engine.create_column_family("orders").unwrap();
    assert_ne!(users, orders);
    assert_ne!(users, DEFAULT_COLUMN_FAMILY);
    assert_eq!(engine.column_family_id("users"), Some(users));
    assert_eq!(engine.column_family(orders).unwrap().name(), "orders");
    assert_eq!(engine.column_family_id("missing"), None);
}

#[test]
fn test_duplicate_name_is_rejected() {
    let engine = setup_engine();
    engine.create_column_family("users").unwrap();
    assert!(matches!(
        engine.create_column_family("users"),
        Err(KestrelError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.create_column_family(DEFAULT_COLUMN_FAMILY_NAME),
        Err(KestrelError::InvalidArgument(_))
    ));
}

#[test]
fn test_keys_are_isolated() {
    let engine = setup_engine();
    let cf = engine.create_column_family("other").unwrap();
    let opts = ReadOptions::default();

    engine.put(b"k", b"default").unwrap();
    engine.put_cf(cf, b"k", b"other").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"default".to_vec()));
    assert_eq!(engine.get_cf(&opts, cf, b"k").unwrap(), Some(b"other".to_vec()));

    engine.delete_cf(cf, b"k").unwrap();
    assert_eq!(engine.get_cf(&opts, cf, b"k").unwrap(), None);
    assert_eq!(engine.get(b"k").unwrap(), Some(b"default".to_vec()));

    engine.delete_range(cf, b"a", b"z").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"default".to_vec()));
}

#[test]
fn test_batch_spans_column_families() {
    let engine = setup_engine();
    let cf = engine.create_column_family("other").unwrap();

    let mut batch = WriteBatch::new();
    batch.put(DEFAULT_COLUMN_FAMILY, b"a", b"1");
    batch.put(cf, b"a", b"2");
    engine.write(&batch).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(
        engine.get_cf(&ReadOptions::default(), cf, b"a").unwrap(),
        Some(b"2".to_vec())
    );

    // a batch naming an unknown column family applies nothing
    let mut bad = WriteBatch::new();
    bad.put(DEFAULT_COLUMN_FAMILY, b"b", b"1");
    bad.put(99, b"b", b"1");
    let before = engine.latest_sequence();
    assert!(engine.write(&bad).is_err());
    assert_eq!(engine.latest_sequence(), before);
    assert_eq!(engine.get(b"b").unwrap(), None);
}

#[test]
fn test_switch_is_per_column_family() {
    let engine = setup_engine();
    let cf = engine.create_column_family("other").unwrap();
    engine.put_cf(cf, b"k", b"v").unwrap();
    engine.switch_memtable(cf).unwrap();

    assert_eq!(engine.column_family(cf).unwrap().num_immutable_memtables(), 1);
    assert_eq!(
        engine
            .column_family(DEFAULT_COLUMN_FAMILY)
            .unwrap()
            .num_immutable_memtables(),
        0
    );
    assert!(engine.switch_memtable(42).is_err());
}

#[test]
fn test_locks_are_per_column_family() {
    let engine = setup_engine();
    let cf = engine.create_column_family("other").unwrap();
    let opts = TransactionOptions {
        lock_timeout: Some(Duration::from_millis(10)),
        ..TransactionOptions::default()
    };

    let mut a = engine.begin_transaction(&opts);
    let mut b = engine.begin_transaction(&opts);
    a.put(b"k", b"a").unwrap();
    b.put_cf(cf, b"k", b"b").unwrap();
    assert_eq!(b.put(b"k", b"b"), Err(KestrelError::LockTimeout));

    a.commit().unwrap();
    b.commit().unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"a".to_vec()));
    assert_eq!(
        engine.get_cf(&ReadOptions::default(), cf, b"k").unwrap(),
        Some(b"b".to_vec())
    );
}
