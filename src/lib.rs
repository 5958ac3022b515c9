//! # KestrelKV
//!
//! The in-memory concurrency core of an LSM key-value engine:
//! - Arena-backed memtable on a lock-free skiplist, with an optional prefix
//!   bloom filter and in-place updates
//! - K-way merging iterator over sorted sources
//! - Pessimistic transactions with striped point locks, deadlock detection,
//!   lock stealing from expired transactions, and two-phase commit
//! - Checksummed log with crash recovery of committed and prepared writes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Transactions / WriteBatch                     │
//! │        (LockTracker, save points, prepare/commit)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ lock keys
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │          PointLockManager  ◀── steal? ── Registry            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                        Engine                                │
//! │            (Single Writer / Multi Reader)                    │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │     Log     │          │  MemTables  │
//!   │  (Append)   │          │ (skiplist)  │
//!   └─────────────┘          └──────┬──────┘
//!                                   │
//!                                   ▼
//!                         ┌──────────────────┐
//!                         │ MergingIterator  │
//!                         └──────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod coding;
pub mod key;
pub mod comparator;
pub mod merge_operator;
pub mod slice_transform;

pub mod iterator;
pub mod memtable;
pub mod wal;
pub mod txn;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use config::{Config, ReadOptions, TransactionOptions};
pub use engine::{DbIterator, Engine, ReadView, Snapshot, DEFAULT_COLUMN_FAMILY_NAME};
pub use error::{KestrelError, Result};
pub use key::{SequenceNumber, ValueType};
pub use memtable::MemTable;
pub use merge_operator::MergeOperator;
pub use txn::{Transaction, TransactionState, WriteBatch, DEFAULT_COLUMN_FAMILY};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of KestrelKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
