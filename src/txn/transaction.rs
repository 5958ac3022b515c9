//! Pessimistic transaction
//!
//! Locks every key before writing it, buffers writes in a private batch, and
//! applies the batch atomically on commit. A named transaction can run the
//! two-phase path (`prepare` then `commit`), in which case its batch is logged
//! at prepare time and applied when the commit marker is written.
//!
//! The lifecycle state is shared with the transaction registry so an expired
//! transaction's locks can be stolen; see [`super::state`] for the CAS rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::comparator::{BytewiseComparator, Comparator};
use crate::config::{ReadOptions, TransactionOptions};
use crate::engine::{Engine, Snapshot};
use crate::error::{KestrelError, Result};
use crate::key::{SequenceNumber, MAX_SEQUENCE_NUMBER};
use crate::merge_operator::{resolve, MergeContext};

use super::lock_manager::{LockRequest, LockedBatch, TransactionId};
use super::registry::TxnShared;
use super::state::TransactionState;
use super::tracker::LockTracker;
use super::write_batch::{BatchOp, ColumnFamilyId, WriteBatch, DEFAULT_COLUMN_FAMILY};

/// Longest accepted transaction name
const MAX_NAME_LEN: usize = 512;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id; ids are never reused
pub(crate) fn next_transaction_id() -> TransactionId {
    NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// What the pending batch says about one key
enum BatchLookup {
    Value(Vec<u8>),
    Deleted,
    /// Only merge operands (possibly none); the database decides the base
    Unresolved,
}

pub struct Transaction<'db, C: Comparator = BytewiseComparator> {
    db: &'db Engine<C>,
    shared: Arc<TxnShared>,
    name: Option<String>,
    lock_timeout: Duration,
    deadlock_detect: bool,
    skip_prepare: bool,
    write_batch: WriteBatch,
    /// Written with the commit marker only; never part of the prepared batch
    commit_time_batch: WriteBatch,
    tracked: LockTracker,
    /// Locks taken since each save point, innermost last
    save_points: Vec<LockTracker>,
    snapshot: Option<Snapshot<'db, C>>,
    /// Log segment holding the prepared batch
    log_number: Option<u64>,
}

impl<'db, C: Comparator> Transaction<'db, C> {
    pub(crate) fn new(db: &'db Engine<C>, options: &TransactionOptions) -> Self {
        let id = next_transaction_id();
        let expiration = options
            .expiration
            .or(db.config().default_expiration)
            .filter(|d| !d.is_zero())
            .and_then(|d| Instant::now().checked_add(d));
        let shared = Arc::new(TxnShared::new(id, expiration));
        if expiration.is_some() {
            db.registry().register_expirable(Arc::clone(&shared));
        }

        let mut txn = Self {
            db,
            shared,
            name: None,
            lock_timeout: options
                .lock_timeout
                .unwrap_or(db.config().transaction_lock_timeout),
            deadlock_detect: options.deadlock_detect,
            skip_prepare: options.skip_prepare,
            write_batch: WriteBatch::new(),
            commit_time_batch: WriteBatch::new(),
            tracked: LockTracker::new(),
            save_points: Vec::new(),
            snapshot: None,
            log_number: None,
        };
        if options.set_snapshot {
            txn.set_snapshot();
        }
        tracing::trace!(txn = id, ?expiration, "transaction started");
        txn
    }

    pub fn id(&self) -> TransactionId {
        self.shared.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Advisory: another party may move a `STARTED` transaction to
    /// `LOCKS_STOLEN` at any time
    pub fn state(&self) -> TransactionState {
        self.shared.state.load()
    }

    pub fn is_expired(&self) -> bool {
        self.shared.is_expired()
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if self.shared.state.load() != TransactionState::Started {
            return Err(KestrelError::invalid("Transaction is beyond state for naming."));
        }
        if self.name.is_some() {
            return Err(KestrelError::invalid("Transaction has already been named."));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(KestrelError::invalid(
                "Transaction name length must be between 1 and 512 chars.",
            ));
        }
        self.db.registry().register_name(name, self.shared.id)?;
        self.name = Some(name.to_string());
        Ok(())
    }

    /// Pin a snapshot at the current sequence. Keys locked from now on are
    /// validated against it.
    pub fn set_snapshot(&mut self) {
        self.snapshot = Some(self.db.snapshot());
    }

    pub fn snapshot_sequence(&self) -> Option<SequenceNumber> {
        self.snapshot.as_ref().map(Snapshot::sequence)
    }

    pub fn write_batch(&self) -> &WriteBatch {
        &self.write_batch
    }

    /// Operations written only together with the commit marker of a
    /// prepared transaction
    pub fn commit_time_batch_mut(&mut self) -> &mut WriteBatch {
        &mut self.commit_time_batch
    }

    pub fn num_keys_locked(&self) -> usize {
        self.tracked.num_keys()
    }

    fn lock_request(&self) -> LockRequest {
        LockRequest {
            txn_id: self.shared.id,
            timeout: Some(self.lock_timeout),
            deadlock_detect: self.deadlock_detect,
            expiration: self.shared.expiration(),
        }
    }

    /// Fails unless the transaction may still lock and write
    fn check_active(&self) -> Result<()> {
        match self.shared.state.load() {
            TransactionState::Started if self.shared.is_expired() => Err(KestrelError::Expired),
            TransactionState::Started => Ok(()),
            TransactionState::LocksStolen => Err(KestrelError::Expired),
            other => Err(KestrelError::invalid(format!(
                "Transaction is in state {} and cannot accept operations.",
                other
            ))),
        }
    }

    fn state_error(observed: TransactionState, op: &str) -> KestrelError {
        match observed {
            TransactionState::LocksStolen => KestrelError::Expired,
            TransactionState::Prepared => {
                KestrelError::invalid("Transaction has already been prepared.")
            }
            TransactionState::Committed => {
                KestrelError::invalid("Transaction has already been committed.")
            }
            TransactionState::RolledBack => {
                KestrelError::invalid("Transaction has already been rolledback.")
            }
            _ => KestrelError::invalid(format!("Transaction is not in state for {}.", op)),
        }
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    /// Lock `key` for this transaction.
    ///
    /// Nothing is acquired if a sufficient lock is already tracked; a shared
    /// lock is upgraded when `exclusive` is requested. With a snapshot set and
    /// `do_validate`, the key must not have been written after the snapshot;
    /// on a conflict the lock just taken is released (or downgraded back) and
    /// the error returned. Locks held before this call are never released here.
    pub fn try_lock(
        &mut self,
        cf: ColumnFamilyId,
        key: &[u8],
        read_only: bool,
        exclusive: bool,
        do_validate: bool,
        assume_tracked: bool,
    ) -> Result<()> {
        self.check_active()?;
        let lm = self.db.lock_manager();
        let req = self.lock_request();

        let status = self.tracked.get(cf, key).copied();
        let previously_locked = status.is_some();
        let lock_upgrade = status.is_some_and(|s| exclusive && !s.exclusive);
        if !previously_locked || lock_upgrade {
            lm.try_lock(&req, cf, key, exclusive)?;
        }

        let mut tracked_at_seq = status.map_or(MAX_SEQUENCE_NUMBER, |s| s.seq);
        match self.snapshot_sequence().filter(|_| do_validate) {
            None => {
                if assume_tracked && !previously_locked {
                    lm.unlock(req.txn_id, cf, key);
                    return Err(KestrelError::invalid(
                        "assume_tracked is set but it is not tracked yet",
                    ));
                }
                if tracked_at_seq == MAX_SEQUENCE_NUMBER {
                    // unvalidated: only known unmodified since it was locked
                    tracked_at_seq = self.db.latest_sequence();
                }
            }
            Some(snap_seq) => {
                if let Err(e) = self.validate_snapshot(cf, key, snap_seq, &mut tracked_at_seq) {
                    if lock_upgrade {
                        if let Err(downgrade) = lm.try_lock(&req, cf, key, false) {
                            tracing::warn!(txn = req.txn_id, error = %downgrade, "failed to downgrade lock");
                        }
                    } else if !previously_locked {
                        lm.unlock(req.txn_id, cf, key);
                    }
                    return Err(e);
                }
            }
        }

        self.track_key(cf, key, tracked_at_seq, read_only, exclusive);
        Ok(())
    }

    fn validate_snapshot(
        &self,
        cf: ColumnFamilyId,
        key: &[u8],
        snap_seq: SequenceNumber,
        tracked_at_seq: &mut SequenceNumber,
    ) -> Result<()> {
        if *tracked_at_seq <= snap_seq {
            // validated at an older sequence already
            return Ok(());
        }
        *tracked_at_seq = snap_seq;
        self.db.check_key_for_conflicts(cf, key, snap_seq)
    }

    fn track_key(
        &mut self,
        cf: ColumnFamilyId,
        key: &[u8],
        seq: SequenceNumber,
        read_only: bool,
        exclusive: bool,
    ) {
        self.tracked.track(cf, key, seq, read_only, exclusive);
        if let Some(sp) = self.save_points.last_mut() {
            sp.track(cf, key, seq, read_only, exclusive);
        }
    }

    /// Exclusively lock `[start, end)` in `cf`
    pub fn get_range_lock(&mut self, cf: ColumnFamilyId, start: &[u8], end: &[u8]) -> Result<()> {
        self.check_active()?;
        if self.tracked.has_range(cf, start, end) {
            return Ok(());
        }
        self.db
            .lock_manager()
            .try_range_lock(&self.lock_request(), cf, start, end)?;
        self.tracked.track_range(cf, start, end);
        if let Some(sp) = self.save_points.last_mut() {
            sp.track_range(cf, start, end);
        }
        Ok(())
    }

    fn release_locks(&self, tracker: &LockTracker) {
        let lm = self.db.lock_manager();
        for ((cf, key), _) in tracker.keys() {
            lm.unlock(self.shared.id, *cf, key);
        }
        for r in tracker.ranges() {
            lm.unlock_range(self.shared.id, r.cf, &r.start, &r.end);
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_cf(DEFAULT_COLUMN_FAMILY, key, value)
    }

    pub fn put_cf(&mut self, cf: ColumnFamilyId, key: &[u8], value: &[u8]) -> Result<()> {
        self.try_lock(cf, key, false, true, true, false)?;
        self.write_batch.put(cf, key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.delete_cf(DEFAULT_COLUMN_FAMILY, key)
    }

    pub fn delete_cf(&mut self, cf: ColumnFamilyId, key: &[u8]) -> Result<()> {
        self.try_lock(cf, key, false, true, true, false)?;
        self.write_batch.delete(cf, key);
        Ok(())
    }

    pub fn single_delete(&mut self, key: &[u8]) -> Result<()> {
        self.single_delete_cf(DEFAULT_COLUMN_FAMILY, key)
    }

    pub fn single_delete_cf(&mut self, cf: ColumnFamilyId, key: &[u8]) -> Result<()> {
        self.try_lock(cf, key, false, true, true, false)?;
        self.write_batch.single_delete(cf, key);
        Ok(())
    }

    pub fn merge(&mut self, key: &[u8], operand: &[u8]) -> Result<()> {
        self.merge_cf(DEFAULT_COLUMN_FAMILY, key, operand)
    }

    pub fn merge_cf(&mut self, cf: ColumnFamilyId, key: &[u8], operand: &[u8]) -> Result<()> {
        self.try_lock(cf, key, false, true, true, false)?;
        self.write_batch.merge(cf, key, operand);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_cf(&ReadOptions::default(), DEFAULT_COLUMN_FAMILY, key)
    }

    /// Read `key` as this transaction sees it: its own pending writes over
    /// the database state at `opts.snapshot`, or at the transaction's
    /// snapshot when `opts` names none
    pub fn get_cf(&self, opts: &ReadOptions, cf: ColumnFamilyId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut operands = MergeContext::new();
        let found = self.lookup_in_batch(cf, key, &mut operands);
        let merge_operator = self.db.config().merge_operator.as_deref();

        let base = match found {
            BatchLookup::Value(v) => Some(v),
            BatchLookup::Deleted => None,
            BatchLookup::Unresolved => {
                let mut read = opts.clone();
                if read.snapshot.is_none() {
                    read.snapshot = self.snapshot_sequence();
                }
                self.db.get_cf(&read, cf, key)?
            }
        };
        if operands.is_empty() {
            return Ok(base);
        }
        resolve(merge_operator, &operands, key, base.as_deref()).map(Some)
    }

    /// Newest-first walk of the pending batch for `key`
    fn lookup_in_batch(&self, cf: ColumnFamilyId, key: &[u8], operands: &mut MergeContext) -> BatchLookup {
        for op in self.write_batch.ops().iter().rev() {
            if op.column_family() != cf {
                continue;
            }
            match op {
                BatchOp::DeleteRange { begin, end, .. } => {
                    if C::compare(begin, key).is_le() && C::compare(key, end).is_lt() {
                        return BatchLookup::Deleted;
                    }
                }
                other if other.key() != key => {}
                BatchOp::Put { value, .. } => return BatchLookup::Value(value.clone()),
                BatchOp::Delete { .. } | BatchOp::SingleDelete { .. } => return BatchLookup::Deleted,
                BatchOp::Merge { value, .. } => operands.push(value.clone()),
            }
        }
        BatchLookup::Unresolved
    }

    pub fn get_for_update(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_for_update_cf(&ReadOptions::default(), DEFAULT_COLUMN_FAMILY, key, true)
    }

    /// Lock `key` (validated against the snapshot, if any) and read it
    pub fn get_for_update_cf(
        &mut self,
        opts: &ReadOptions,
        cf: ColumnFamilyId,
        key: &[u8],
        exclusive: bool,
    ) -> Result<Option<Vec<u8>>> {
        if let (Some(txn_seq), Some(read_seq)) = (self.snapshot_sequence(), opts.snapshot) {
            if read_seq > txn_seq {
                return Err(KestrelError::invalid(
                    "Read snapshot is newer than the transaction snapshot",
                ));
            }
        }
        self.try_lock(cf, key, true, exclusive, true, false)?;
        self.get_cf(opts, cf, key)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Log the pending batch as a prepared section. The log segment holding
    /// it is retained until the transaction commits or rolls back.
    pub fn prepare(&mut self) -> Result<()> {
        let Some(name) = self.name.clone() else {
            return Err(KestrelError::invalid(
                "Cannot prepare a transaction that has not been named.",
            ));
        };
        if self.shared.is_expired() {
            return Err(KestrelError::Expired);
        }
        self.shared
            .state
            .transition(TransactionState::Started, TransactionState::AwaitingPrepare)
            .map_err(|observed| Self::state_error(observed, "prepare"))?;

        match self.db.log_prepare(&name, &self.write_batch) {
            Ok(log_number) => {
                self.log_number = Some(log_number);
                self.shared.clear_expiration();
                self.set_state(TransactionState::AwaitingPrepare, TransactionState::Prepared);
                tracing::debug!(txn = self.shared.id, name = %name, log_number, "transaction prepared");
                Ok(())
            }
            Err(e) => {
                self.set_state(TransactionState::AwaitingPrepare, TransactionState::Started);
                Err(e)
            }
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        match self.shared.state.load() {
            TransactionState::Started => {
                if self.shared.is_expired() {
                    return Err(KestrelError::Expired);
                }
                if !self.commit_time_batch.is_empty() {
                    return Err(KestrelError::invalid(
                        "Commit-time batch contains values that will not be committed.",
                    ));
                }
                if self.name.is_some() && !self.skip_prepare {
                    return Err(KestrelError::invalid(
                        "Transaction must be prepared before commit.",
                    ));
                }
                self.shared
                    .state
                    .transition(TransactionState::Started, TransactionState::AwaitingCommit)
                    .map_err(|observed| Self::state_error(observed, "commit"))?;
                self.commit_without_prepare()
            }
            TransactionState::Prepared => {
                self.shared
                    .state
                    .transition(TransactionState::Prepared, TransactionState::AwaitingCommit)
                    .map_err(|observed| Self::state_error(observed, "commit"))?;
                self.commit_prepared()
            }
            other => Err(Self::state_error(other, "commit")),
        }
    }

    fn commit_without_prepare(&mut self) -> Result<()> {
        if let Err(e) = self.db.write_locked(&self.write_batch) {
            self.set_state(TransactionState::AwaitingCommit, TransactionState::Started);
            return Err(e);
        }
        self.finish(TransactionState::AwaitingCommit, TransactionState::Committed);
        Ok(())
    }

    fn commit_prepared(&mut self) -> Result<()> {
        let name = self.name.clone().unwrap_or_default();
        if let Err(e) = self.db.commit_prepared(
            &name,
            &self.write_batch,
            &self.commit_time_batch,
            self.log_number,
        ) {
            self.set_state(TransactionState::AwaitingCommit, TransactionState::Prepared);
            return Err(e);
        }
        self.log_number = None;
        self.finish(TransactionState::AwaitingCommit, TransactionState::Committed);
        Ok(())
    }

    /// Discard the transaction.
    ///
    /// A prepared transaction writes a rollback marker so recovery ignores
    /// its prepared section. A transaction whose locks were stolen releases
    /// whatever it still holds and reports `Expired`.
    pub fn rollback(&mut self) -> Result<()> {
        match self.shared.state.load() {
            TransactionState::Prepared => {
                self.shared
                    .state
                    .transition(TransactionState::Prepared, TransactionState::AwaitingRollback)
                    .map_err(|observed| Self::state_error(observed, "rollback"))?;
                let name = self.name.clone().unwrap_or_default();
                if let Err(e) = self.db.log_rollback(&name, self.log_number) {
                    self.set_state(TransactionState::AwaitingRollback, TransactionState::Prepared);
                    return Err(e);
                }
                self.log_number = None;
                self.finish(TransactionState::AwaitingRollback, TransactionState::RolledBack);
                Ok(())
            }
            TransactionState::Started => {
                match self
                    .shared
                    .state
                    .transition(TransactionState::Started, TransactionState::AwaitingRollback)
                {
                    Ok(()) => {
                        self.finish(TransactionState::AwaitingRollback, TransactionState::RolledBack);
                        Ok(())
                    }
                    Err(TransactionState::LocksStolen) => self.abandon_stolen(),
                    Err(observed) => Err(Self::state_error(observed, "rollback")),
                }
            }
            TransactionState::LocksStolen => self.abandon_stolen(),
            TransactionState::Committed => Err(KestrelError::invalid(
                "This transaction has already been committed.",
            )),
            _ => Err(KestrelError::invalid(
                "Two phase transaction is not in state for rollback.",
            )),
        }
    }

    fn abandon_stolen(&mut self) -> Result<()> {
        self.release_everything();
        tracing::debug!(txn = self.shared.id, "rolled back transaction whose locks were stolen");
        Err(KestrelError::Expired)
    }

    fn set_state(&self, from: TransactionState, to: TransactionState) {
        if let Err(observed) = self.shared.state.transition(from, to) {
            // only this thread moves a transaction out of an AWAITING_* state
            tracing::error!(
                txn = self.shared.id,
                %from,
                %to,
                %observed,
                "unexpected transaction state"
            );
        }
    }

    /// Move to a terminal state and let go of every resource
    fn finish(&mut self, from: TransactionState, to: TransactionState) {
        self.release_everything();
        self.set_state(from, to);
        tracing::debug!(txn = self.shared.id, state = %to, "transaction finished");
    }

    fn release_everything(&mut self) {
        let tracked = std::mem::take(&mut self.tracked);
        self.release_locks(&tracked);
        self.save_points.clear();
        self.write_batch.clear();
        self.commit_time_batch.clear();
        self.db.registry().unregister_expirable(self.shared.id);
        if let Some(name) = self.name.take() {
            self.db.registry().unregister_name(&name);
        }
    }

    // -------------------------------------------------------------------------
    // Save Points
    // -------------------------------------------------------------------------

    pub fn set_save_point(&mut self) {
        self.write_batch.set_save_point();
        self.save_points.push(LockTracker::new());
    }

    /// Undo writes since the newest save point and release the locks that
    /// were first taken after it
    pub fn rollback_to_save_point(&mut self) -> Result<()> {
        match self.shared.state.load() {
            TransactionState::Started => {}
            TransactionState::LocksStolen => return Err(KestrelError::Expired),
            _ => {
                return Err(KestrelError::invalid("Transaction is beyond state for rollback."));
            }
        }
        let Some(since) = self.save_points.pop() else {
            return Err(KestrelError::NotFound);
        };
        let (keys, ranges) = self.tracked.subtract(&since);
        let lm = self.db.lock_manager();
        for (cf, key) in &keys {
            lm.unlock(self.shared.id, *cf, key);
        }
        for r in &ranges {
            lm.unlock_range(self.shared.id, r.cf, &r.start, &r.end);
        }
        self.write_batch.rollback_to_save_point()
    }

    /// Forget the newest save point; an enclosing one inherits its locks
    pub fn pop_save_point(&mut self) -> Result<()> {
        let Some(top) = self.save_points.pop() else {
            return Err(KestrelError::NotFound);
        };
        if let Some(below) = self.save_points.last_mut() {
            below.merge(&top);
        }
        self.write_batch.pop_save_point()
    }
}

/// A transaction dropped while prepared is handed to the engine with its
/// locks and name still held, as recovery would find it. It stays registered
/// in its prepared state so expired lock records cannot be stolen from it.
/// Anything else releases what it holds.
impl<C: Comparator> Drop for Transaction<'_, C> {
    fn drop(&mut self) {
        let tracked = std::mem::take(&mut self.tracked);
        if self.shared.state.load() == TransactionState::Prepared {
            if let (Some(name), Some(log_number)) = (self.name.take(), self.log_number) {
                let locks = LockedBatch::from_tracker(self.shared.id, &tracked);
                let batch = std::mem::take(&mut self.write_batch);
                self.db
                    .adopt_prepared(name, batch, log_number, self.shared.id, locks);
                return;
            }
        }
        self.db.registry().unregister_expirable(self.shared.id);
        self.release_locks(&tracked);
        if let Some(name) = self.name.take() {
            self.db.registry().unregister_name(&name);
        }
    }
}
