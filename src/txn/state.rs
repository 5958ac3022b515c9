//! Transaction lifecycle state
//!
//! ```text
//!   STARTED ──▶ AWAITING_PREPARE ──▶ PREPARED ──▶ AWAITING_COMMIT ──▶ COMMITTED
//!      │                                 │
//!      ├──────────────▶ AWAITING_COMMIT  │
//!      │                                 │
//!      ├──────────▶ AWAITING_ROLLBACK ◀──┘ ──▶ ROLLEDBACK
//!      │
//!      └──▶ LOCKS_STOLEN   (expiration sweep only)
//! ```
//!
//! The state is shared with whoever may steal an expired transaction's
//! locks, so every transition is a compare-and-swap from the expected prior
//! state. A failed swap means another party already moved the transaction;
//! the caller must re-read and branch instead of retrying. Plain loads are
//! hints only.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    Started = 0,
    AwaitingPrepare = 1,
    Prepared = 2,
    AwaitingCommit = 3,
    Committed = 4,
    AwaitingRollback = 5,
    RolledBack = 6,
    LocksStolen = 7,
}

impl TransactionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TransactionState::Started,
            1 => TransactionState::AwaitingPrepare,
            2 => TransactionState::Prepared,
            3 => TransactionState::AwaitingCommit,
            4 => TransactionState::Committed,
            5 => TransactionState::AwaitingRollback,
            6 => TransactionState::RolledBack,
            _ => TransactionState::LocksStolen,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Started => "STARTED",
            TransactionState::AwaitingPrepare => "AWAITING_PREPARE",
            TransactionState::Prepared => "PREPARED",
            TransactionState::AwaitingCommit => "AWAITING_COMMIT",
            TransactionState::Committed => "COMMITTED",
            TransactionState::AwaitingRollback => "AWAITING_ROLLBACK",
            TransactionState::RolledBack => "ROLLEDBACK",
            TransactionState::LocksStolen => "LOCKS_STOLEN",
        };
        f.write_str(s)
    }
}

/// Atomic cell holding a [`TransactionState`]
#[derive(Debug)]
pub struct AtomicTransactionState(AtomicU8);

impl AtomicTransactionState {
    pub fn new(state: TransactionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Advisory read; act on it only through [`transition`](Self::transition)
    pub fn load(&self) -> TransactionState {
        TransactionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from → to`. On failure returns the state actually observed.
    pub fn transition(
        &self,
        from: TransactionState,
        to: TransactionState,
    ) -> Result<(), TransactionState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TransactionState::from_u8)
    }
}
