//! Transaction Module
//!
//! Pessimistic (lock-before-write) transactions.
//!
//! ## Responsibilities
//! - Buffer a transaction's writes in a [`WriteBatch`] until commit
//! - Lock keys through a [`LockManager`] before they are written or read for update
//! - Validate locked keys against the transaction's snapshot
//! - Two-phase commit for named transactions (prepare, then commit or rollback)
//! - Let expired transactions' locks be stolen so abandoned work cannot block
//!   others forever
//!
//! ## Lock Ownership
//! ```text
//!   Transaction ──tracks──▶ LockTracker  (what it holds, per save point)
//!        │
//!        └──acquires──▶ LockManager ◀──steal?── TransactionRegistry
//! ```

mod lock_manager;
mod registry;
mod state;
mod tracker;
mod transaction;
mod write_batch;

pub use lock_manager::{
    lock_batch, KeyLockInfo, LockManager, LockRequest, LockStealer, LockedBatch,
    PointLockManager, TransactionId,
};
pub use registry::TransactionRegistry;
pub use state::{AtomicTransactionState, TransactionState};
pub use tracker::{LockTracker, TrackedKeyInfo, TrackedRange};
pub use transaction::Transaction;
pub use write_batch::{BatchOp, ColumnFamilyId, WriteBatch, WriteBatchHandler, DEFAULT_COLUMN_FAMILY};

pub(crate) use transaction::next_transaction_id;
