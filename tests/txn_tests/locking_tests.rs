//! Tests for transaction locking
//!
//! These tests verify:
//! - Exclusive and shared lock compatibility
//! - Snapshot validation rejects keys written after the snapshot
//! - Deadlock detection breaks wait cycles
//! - Plain writes and range locks respect transaction locks

use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use kestrelkv::txn::{lock_batch, LockManager, LockRequest, PointLockManager};
use kestrelkv::{
    Config, Engine, KestrelError, ReadOptions, TransactionOptions, WriteBatch, DEFAULT_COLUMN_FAMILY,
};

fn engine() -> Engine {
    Engine::new(
        Config::builder()
            .default_lock_timeout(Duration::from_millis(20))
            .build(),
    )
    .unwrap()
}

fn wait_for(ms: u64) -> TransactionOptions {
    TransactionOptions {
        lock_timeout: Some(Duration::from_millis(ms)),
        ..TransactionOptions::default()
    }
}

fn with_snapshot() -> TransactionOptions {
    TransactionOptions {
        set_snapshot: true,
        lock_timeout: Some(Duration::from_millis(10)),
        ..TransactionOptions::default()
    }
}

// =============================================================================
// Point Lock Tests
// =============================================================================

#[test]
fn test_exclusive_lock_blocks_second_writer() {
    let engine = engine();
    let mut a = engine.begin_transaction(&wait_for(10));
    let mut b = engine.begin_transaction(&wait_for(10));

    a.put(b"k", b"a").unwrap();
    assert_eq!(b.put(b"k", b"b"), Err(KestrelError::LockTimeout));
    assert_eq!(b.get_for_update(b"k"), Err(KestrelError::LockTimeout));
    assert_eq!(b.num_keys_locked(), 0);

    a.commit().unwrap();
    b.put(b"k", b"b").unwrap();
    b.commit().unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"b".to_vec()));
}

#[test]
fn test_shared_locks_coexist_and_block_writers() {
    let engine = engine();
    engine.put(b"k", b"v").unwrap();
    let opts = ReadOptions::default();

    let mut r1 = engine.begin_transaction(&wait_for(10));
    let mut r2 = engine.begin_transaction(&wait_for(10));
    let mut w = engine.begin_transaction(&wait_for(10));

    assert_eq!(
        r1.get_for_update_cf(&opts, DEFAULT_COLUMN_FAMILY, b"k", false).unwrap(),
        Some(b"v".to_vec())
    );
    assert_eq!(
        r2.get_for_update_cf(&opts, DEFAULT_COLUMN_FAMILY, b"k", false).unwrap(),
        Some(b"v".to_vec())
    );
    assert_eq!(w.put(b"k", b"w"), Err(KestrelError::LockTimeout));

    // a shared holder cannot upgrade while another shares the key
    assert_eq!(r1.put(b"k", b"r1"), Err(KestrelError::LockTimeout));
    r2.rollback().unwrap();
    r1.put(b"k", b"r1").unwrap();
    r1.commit().unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"r1".to_vec()));
}

#[test]
fn test_plain_write_waits_on_transaction_lock() {
    let engine = engine();
    let mut txn = engine.begin_transaction(&TransactionOptions::default());
    txn.put(b"k", b"txn").unwrap();

    assert_eq!(engine.put(b"k", b"plain"), Err(KestrelError::LockTimeout));
    assert_eq!(engine.get(b"k").unwrap(), None);

    txn.commit().unwrap();
    engine.put(b"k", b"plain").unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"plain".to_vec()));
}

#[test]
fn test_range_lock_blocks_keys_inside() {
    let engine = engine();
    let mut ranger = engine.begin_transaction(&wait_for(10));
    ranger.get_range_lock(DEFAULT_COLUMN_FAMILY, b"b", b"d").unwrap();
    // taking the same range again is a no-op
    ranger.get_range_lock(DEFAULT_COLUMN_FAMILY, b"b", b"d").unwrap();

    let mut other = engine.begin_transaction(&wait_for(10));
    assert_eq!(other.put(b"c", b"x"), Err(KestrelError::LockTimeout));
    other.put(b"d", b"x").unwrap();
    other.put(b"a", b"x").unwrap();

    ranger.put(b"c", b"mine").unwrap();
    ranger.commit().unwrap();
    other.put(b"c", b"x").unwrap();
    other.commit().unwrap();
}

// =============================================================================
// Snapshot Validation Tests
// =============================================================================

#[test]
fn test_write_after_snapshot_is_busy() {
    let engine = engine();
    let mut txn = engine.begin_transaction(&with_snapshot());
    engine.put(b"k", b"newer").unwrap();

    assert!(matches!(txn.put(b"k", b"mine"), Err(KestrelError::Busy(_))));
    assert!(matches!(txn.get_for_update(b"k"), Err(KestrelError::Busy(_))));
    // the failed lock was released
    assert_eq!(txn.num_keys_locked(), 0);
    engine.put(b"k", b"again").unwrap();

    // untouched keys still validate
    txn.put(b"other", b"v").unwrap();
    txn.commit().unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"again".to_vec()));
}

#[test]
fn test_validated_key_stays_locked_after_later_conflict() {
    let engine = engine();
    let mut txn = engine.begin_transaction(&with_snapshot());
    txn.put(b"a", b"1").unwrap();
    engine.put(b"b", b"x").unwrap();

    assert!(txn.put(b"b", b"2").is_err());
    // "a" was locked before the failure and is kept
    assert_eq!(txn.num_keys_locked(), 1);
    assert_eq!(engine.put(b"a", b"x"), Err(KestrelError::LockTimeout));
}

#[test]
fn test_snapshot_older_than_column_family_validates() {
    let engine = engine();
    engine.put(b"seed", b"1").unwrap();
    let mut txn = engine.begin_transaction(&with_snapshot());
    engine.put(b"later", b"2").unwrap();
    let cf = engine.create_column_family("late").unwrap();
    engine.put_cf(cf, b"taken", b"x").unwrap();

    txn.put_cf(cf, b"fresh", b"mine").unwrap();
    assert!(matches!(txn.put_cf(cf, b"taken", b"mine"), Err(KestrelError::Busy(_))));
    txn.commit().unwrap();
    assert_eq!(
        engine.get_cf(&ReadOptions::default(), cf, b"fresh").unwrap(),
        Some(b"mine".to_vec())
    );
}

#[test]
fn test_snapshot_taken_later_sees_earlier_writes() {
    let engine = engine();
    let mut txn = engine.begin_transaction(&wait_for(10));
    engine.put(b"k", b"before").unwrap();
    txn.set_snapshot();
    assert_eq!(txn.snapshot_sequence(), Some(engine.latest_sequence()));

    assert_eq!(txn.get_for_update(b"k").unwrap(), Some(b"before".to_vec()));
    txn.put(b"k", b"after").unwrap();
    txn.commit().unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"after".to_vec()));
}

#[test]
fn test_read_snapshot_newer_than_transaction_is_rejected() {
    let engine = engine();
    let mut txn = engine.begin_transaction(&with_snapshot());
    engine.put(b"x", b"1").unwrap();
    let newer = ReadOptions::at(engine.latest_sequence());

    assert!(matches!(
        txn.get_for_update_cf(&newer, DEFAULT_COLUMN_FAMILY, b"k", true),
        Err(KestrelError::InvalidArgument(_))
    ));
}

#[test]
fn test_assume_tracked_requires_existing_lock() {
    let engine = engine();
    let mut txn = engine.begin_transaction(&wait_for(10));
    assert!(matches!(
        txn.try_lock(DEFAULT_COLUMN_FAMILY, b"k", false, true, false, true),
        Err(KestrelError::InvalidArgument(_))
    ));
    assert_eq!(txn.num_keys_locked(), 0);

    txn.try_lock(DEFAULT_COLUMN_FAMILY, b"k", false, true, false, false)
        .unwrap();
    txn.try_lock(DEFAULT_COLUMN_FAMILY, b"k", false, true, false, true)
        .unwrap();
    assert_eq!(txn.num_keys_locked(), 1);
}

// =============================================================================
// Deadlock Tests
// =============================================================================

#[test]
fn test_deadlock_cycle_is_detected() {
    let engine = engine();
    let opts = TransactionOptions {
        deadlock_detect: true,
        lock_timeout: Some(Duration::from_secs(5)),
        ..TransactionOptions::default()
    };
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        let first = s.spawn(|| {
            let mut t1 = engine.begin_transaction(&opts);
            t1.put(b"a", b"t1").unwrap();
            barrier.wait();
            // blocks on t2 until t2 gives up
            t1.put(b"b", b"t1").unwrap();
            t1.commit()
        });

        let mut t2 = engine.begin_transaction(&opts);
        t2.put(b"b", b"t2").unwrap();
        barrier.wait();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(t2.put(b"a", b"t2"), Err(KestrelError::Deadlock));
        t2.rollback().unwrap();

        first.join().unwrap().unwrap();
    });

    assert_eq!(engine.get(b"a").unwrap(), Some(b"t1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"t1".to_vec()));
}

// =============================================================================
// Lock Manager Tests
// =============================================================================

#[test]
fn test_lock_batch_locks_every_key_once() {
    let lm = PointLockManager::new(8, 50);
    let mut batch = WriteBatch::new();
    batch.put(0, b"b", b"1");
    batch.put(0, b"a", b"1");
    batch.merge(0, b"b", b"2");
    batch.delete(1, b"a");
    batch.delete_range(0, b"m", b"p");

    let locked = lock_batch(&lm, &LockRequest::new(7, Duration::ZERO), &batch).unwrap();
    assert_eq!(locked.num_keys(), 3);
    let mut status = lm.lock_status();
    status.sort_by(|x, y| (x.cf, &x.key).cmp(&(y.cf, &y.key)));
    let keys: Vec<(u32, Vec<u8>)> = status.iter().map(|s| (s.cf, s.key.clone())).collect();
    assert_eq!(
        keys,
        vec![(0, b"a".to_vec()), (0, b"b".to_vec()), (1, b"a".to_vec())]
    );
    assert!(status.iter().all(|s| s.exclusive && s.holders == vec![7]));

    // the range is held too
    assert_eq!(
        lm.try_lock(&LockRequest::new(8, Duration::ZERO), 0, b"n", true),
        Err(KestrelError::LockTimeout)
    );

    locked.unlock(&lm);
    assert!(lm.lock_status().is_empty());
    lm.try_lock(&LockRequest::new(8, Duration::ZERO), 0, b"n", true)
        .unwrap();
}

#[test]
fn test_waiter_wakes_on_unlock() {
    let lm = PointLockManager::new(4, 50);
    lm.try_lock(&LockRequest::new(1, Duration::ZERO), 0, b"k", true)
        .unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| lm.try_lock(&LockRequest::new(2, Duration::from_secs(5)), 0, b"k", true));
        thread::sleep(Duration::from_millis(50));
        lm.unlock(1, 0, b"k");
        waiter.join().unwrap().unwrap();
    });
    let status = lm.lock_status();
    assert_eq!(status[0].holders, vec![2]);
}
