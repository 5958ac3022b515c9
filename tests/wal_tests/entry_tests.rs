//! Tests for log entry framing
//!
//! These tests verify:
//! - Every record kind survives framing
//! - CRC32 corruption detection
//! - Truncated and malformed frames are rejected

use kestrelkv::txn::{WriteBatch, DEFAULT_COLUMN_FAMILY};
use kestrelkv::wal::{LogEntry, LogRecord, HEADER_SIZE};
use kestrelkv::KestrelError;

fn sample_batch() -> WriteBatch {
    let mut batch = WriteBatch::new();
    batch.put(DEFAULT_COLUMN_FAMILY, b"k1", b"v1");
    batch.delete(DEFAULT_COLUMN_FAMILY, b"k2");
    batch.merge(3, b"k3", b"+1");
    batch.delete_range(DEFAULT_COLUMN_FAMILY, b"a", b"f");
    batch
}

// =============================================================================
// Framing Tests
// =============================================================================

#[test]
fn test_every_record_kind_survives_framing() {
    let records = vec![
        LogRecord::ColumnFamily {
            id: 2,
            name: "users".into(),
        },
        LogRecord::Batch {
            sequence: 17,
            batch: sample_batch(),
        },
        LogRecord::Prepare {
            name: "xid".into(),
            batch: sample_batch(),
        },
        LogRecord::Commit {
            name: "xid".into(),
            sequence: 40,
            commit_time_batch: WriteBatch::new(),
        },
        LogRecord::Rollback { name: "xid".into() },
    ];

    for (i, record) in records.into_iter().enumerate() {
        let entry = LogEntry::new(i as u64 + 1, record);
        let bytes = entry.serialize().unwrap();
        assert_eq!(bytes.len(), entry.serialized_size().unwrap());
        assert_eq!(LogEntry::deserialize(&bytes).unwrap(), entry);
    }
}

#[test]
fn test_header_layout() {
    let entry = LogEntry::new(0x0102_0304_0506_0708, LogRecord::Rollback { name: "t".into() });
    let bytes = entry.serialize().unwrap();

    assert_eq!(&bytes[0..8], &0x0102_0304_0506_0708u64.to_le_bytes());
    let len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    assert_eq!(bytes.len(), HEADER_SIZE + len);
    let crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    assert_eq!(crc, crc32fast::hash(&bytes[HEADER_SIZE..]));
}

#[test]
fn test_deserialize_ignores_trailing_bytes() {
    let entry = LogEntry::new(5, LogRecord::Rollback { name: "t".into() });
    let mut bytes = entry.serialize().unwrap();
    bytes.extend_from_slice(b"next frame");
    assert_eq!(LogEntry::deserialize(&bytes).unwrap(), entry);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_flipped_payload_bit_is_corruption() {
    let entry = LogEntry::new(
        1,
        LogRecord::Batch {
            sequence: 1,
            batch: sample_batch(),
        },
    );
    let mut bytes = entry.serialize().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    assert!(matches!(
        LogEntry::deserialize(&bytes),
        Err(KestrelError::Corruption(_))
    ));
}

#[test]
fn test_flipped_crc_is_corruption() {
    let entry = LogEntry::new(1, LogRecord::Rollback { name: "t".into() });
    let mut bytes = entry.serialize().unwrap();
    bytes[9] ^= 0xFF;
    assert!(matches!(
        LogEntry::deserialize(&bytes),
        Err(KestrelError::Corruption(_))
    ));
}

#[test]
fn test_short_input_is_corruption() {
    let entry = LogEntry::new(1, LogRecord::Rollback { name: "t".into() });
    let bytes = entry.serialize().unwrap();

    assert!(matches!(
        LogEntry::deserialize(&bytes[..HEADER_SIZE - 1]),
        Err(KestrelError::Corruption(_))
    ));
    assert!(matches!(
        LogEntry::deserialize(&bytes[..bytes.len() - 1]),
        Err(KestrelError::Corruption(_))
    ));
    assert!(LogEntry::deserialize(&[]).is_err());
}

#[test]
fn test_large_batch_round_trips() {
    let mut batch = WriteBatch::new();
    let value = vec![0xAB; 64 * 1024];
    for i in 0..32u32 {
        batch.put(DEFAULT_COLUMN_FAMILY, &i.to_be_bytes(), &value);
    }
    let entry = LogEntry::new(9, LogRecord::Batch { sequence: 100, batch });
    let bytes = entry.serialize().unwrap();
    assert!(bytes.len() > 32 * 64 * 1024);
    assert_eq!(LogEntry::deserialize(&bytes).unwrap(), entry);
}
