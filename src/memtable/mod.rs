//! MemTable Module
//!
//! In-memory sorted buffer for recent writes.
//!
//! ## Responsibilities
//! - Store versioned records in (user key asc, sequence desc) order
//! - Answer point reads and batched reads at a snapshot, folding merge
//!   operands and honouring range tombstones
//! - Track entry/size counters and decide when the buffer should be flushed
//! - Expose sorted cursors so a memtable can feed a merging iterator
//!
//! ## Data Structure Choice
//! `crossbeam_skiplist::SkipMap` for both point entries and range tombstones:
//! - Lock-free inserts, so concurrent writers need no table-wide lock
//! - Readers never block writers
//! - Record bytes live in arena blocks; the skiplist holds views into them

mod arena;
mod bloom;
mod iterator;
mod range_del;
mod table;

pub use arena::Arena;
pub use iterator::{MemTableIterator, RangeTombstoneIterator};
pub use table::{FlushState, InsertHint, MemTable};

use crate::error::{KestrelError, Result};
use crate::key::{LookupKey, SequenceNumber};
use crate::merge_operator::MergeContext;

/// Visibility predicate over sequence numbers, consulted by point reads.
/// Versions it rejects are skipped as if absent.
pub trait ReadCallback {
    fn is_visible(&self, seq: SequenceNumber) -> bool;
}

impl<F: Fn(SequenceNumber) -> bool> ReadCallback for F {
    fn is_visible(&self, seq: SequenceNumber) -> bool {
        self(seq)
    }
}

/// Per-key state threaded through the memtables consulted by one read,
/// newest memtable first
#[derive(Debug, Default, Clone)]
pub struct GetContext {
    /// Merge operands collected so far, newest first
    pub merge: MergeContext,
    /// Largest sequence of a range tombstone covering the key, 0 if none
    pub max_covering_tombstone_seq: SequenceNumber,
}

/// Result of a point read against one memtable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    /// A value, possibly produced by the merge operator
    Found(Vec<u8>),
    /// Newest visible version is a tombstone
    Deleted,
    /// Operands were collected but no base was found; older sources decide
    MergeInProgress,
    /// Nothing here for this key
    NotFound,
}

impl GetOutcome {
    /// Whether older sources can be skipped
    pub fn is_final(&self) -> bool {
        matches!(self, GetOutcome::Found(_) | GetOutcome::Deleted)
    }
}

/// One key of a batched read
#[derive(Debug)]
pub struct MultiGetKey {
    pub lookup: LookupKey,
    pub ctx: GetContext,
    /// `None` while the key is still unresolved
    pub outcome: Option<Result<GetOutcome>>,
}

/// Keys of a batched read plus the running value-size budget
#[derive(Debug)]
pub struct MultiGetBatch {
    pub keys: Vec<MultiGetKey>,
    pub value_size: usize,
    pub value_size_soft_limit: usize,
}

impl MultiGetBatch {
    pub fn new(keys: &[&[u8]], snapshot: SequenceNumber, value_size_soft_limit: usize) -> Self {
        Self {
            keys: keys
                .iter()
                .map(|k| MultiGetKey {
                    lookup: LookupKey::new(k, snapshot),
                    ctx: GetContext::default(),
                    outcome: None,
                })
                .collect(),
            value_size: 0,
            value_size_soft_limit,
        }
    }

    /// Indices of keys not yet resolved
    pub fn pending(&self) -> impl Iterator<Item = usize> + '_ {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.outcome.is_none())
            .map(|(i, _)| i)
    }

    pub fn is_done(&self) -> bool {
        self.pending().next().is_none()
    }

    /// Mark every unresolved key `Aborted`
    pub fn abort_pending(&mut self) {
        for key in self.keys.iter_mut().filter(|k| k.outcome.is_none()) {
            key.outcome = Some(Err(KestrelError::Aborted(
                "value size soft limit exceeded".to_string(),
            )));
        }
    }
}

/// What an `update_callback` closure did with the existing value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Leave the key untouched
    Failed,
    /// New value, to be written over the old one if it fits
    UpdatedInPlace(Vec<u8>),
    /// New value, always appended as a fresh version
    Updated(Vec<u8>),
}
