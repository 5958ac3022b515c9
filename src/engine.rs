//! Engine Module
//!
//! The in-memory engine that coordinates all components.
//!
//! ## Responsibilities
//! - Own column families and their memtable lists (one active, then
//!   immutables newest first)
//! - Assign sequence numbers, log, and insert writes
//! - Switch memtables once the active one asks to be flushed
//! - Serve point reads, batched reads and iterators at a snapshot
//! - Host pessimistic transactions: lock manager, registry, conflict checks
//! - Rebuild state from log segments
//!
//! ## Write Path
//! ```text
//!   write(batch) ──▶ lock_batch ──▶ write_lock ──▶ log ──▶ memtables
//!                                       │                     │
//!                                       └── publish sequence ◀┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
use crate::config::{Config, ReadOptions, TransactionOptions};
use crate::error::{KestrelError, Result};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::key::{LookupKey, ParsedInternalKey, SequenceNumber, ValueType};
use crate::memtable::{GetContext, GetOutcome, InsertHint, MemTable, MultiGetBatch, UpdateStatus};
use crate::merge_operator::{resolve, MergeContext, MergeOperator};
use crate::txn::{
    lock_batch, next_transaction_id, BatchOp, ColumnFamilyId, LockManager, LockRequest,
    LockStealer, LockedBatch, PointLockManager, Transaction, TransactionId, TransactionRegistry, WriteBatch,
    WriteBatchHandler, DEFAULT_COLUMN_FAMILY,
};
use crate::wal::{Durability, LogRecord, LogRecovery, LogSegment, LogWriter};

/// Name of the column family every engine starts with
pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

// =============================================================================
// Column Families
// =============================================================================

struct MemTableList<C: Comparator> {
    active: Arc<MemTable<C>>,
    /// Switched-out memtables, newest first
    immutables: Vec<Arc<MemTable<C>>>,
}

pub struct ColumnFamilyData<C: Comparator> {
    id: ColumnFamilyId,
    name: String,
    memtables: RwLock<MemTableList<C>>,
}

impl<C: Comparator> ColumnFamilyData<C> {
    pub fn id(&self) -> ColumnFamilyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_memtable(&self) -> Arc<MemTable<C>> {
        Arc::clone(&self.memtables.read().active)
    }

    pub fn num_immutable_memtables(&self) -> usize {
        self.memtables.read().immutables.len()
    }

    /// Every memtable, newest first
    fn memtables(&self) -> Vec<Arc<MemTable<C>>> {
        let list = self.memtables.read();
        std::iter::once(&list.active)
            .chain(list.immutables.iter())
            .cloned()
            .collect()
    }
}

struct ColumnFamilySet<C: Comparator> {
    by_name: HashMap<String, ColumnFamilyId>,
    by_id: BTreeMap<ColumnFamilyId, Arc<ColumnFamilyData<C>>>,
    next_id: ColumnFamilyId,
}

/// A prepared transaction found in the log with no commit or rollback
/// marker. Its keys stay locked until it is resolved.
struct RecoveredTransaction {
    batch: WriteBatch,
    log_number: u64,
    txn_id: TransactionId,
    locks: LockedBatch,
}

// =============================================================================
// Engine
// =============================================================================

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes**: serialized by `write_lock` once their keys are locked
///   - Must acquire: key locks → write_lock → log → memtables
///   - The sequence is published only after every insert of the batch
///
/// - **Reads**: never take `write_lock`
///   - Memtables are lock-free; readers only briefly take the column
///     family's memtable list read lock to pin the current set
pub struct Engine<C: Comparator = BytewiseComparator> {
    config: Config,
    column_families: RwLock<ColumnFamilySet<C>>,
    write_lock: Mutex<()>,
    last_sequence: AtomicU64,
    next_memtable_id: AtomicU64,
    /// Live snapshot sequences → handle count
    snapshots: Mutex<BTreeMap<SequenceNumber, usize>>,
    lock_manager: Arc<dyn LockManager>,
    log: Arc<LogWriter>,
    registry: Arc<TransactionRegistry>,
    recovered: Mutex<HashMap<String, RecoveredTransaction>>,
}

impl<C: Comparator> Engine<C> {
    /// Create an empty engine with a fresh log
    pub fn new(config: Config) -> Result<Self> {
        let log = LogWriter::new(config.max_log_segment_size);
        Self::with_log(config, log)
    }

    fn with_log(config: Config, log: LogWriter) -> Result<Self> {
        let registry = Arc::new(TransactionRegistry::new());
        let lock_manager = PointLockManager::new(config.num_lock_stripes, config.deadlock_detect_depth)
            .with_stealer(Arc::clone(&registry) as Arc<dyn LockStealer>)
            .with_key_order(C::compare);

        let engine = Self {
            config,
            column_families: RwLock::new(ColumnFamilySet {
                by_name: HashMap::new(),
                by_id: BTreeMap::new(),
                next_id: DEFAULT_COLUMN_FAMILY,
            }),
            write_lock: Mutex::new(()),
            last_sequence: AtomicU64::new(0),
            next_memtable_id: AtomicU64::new(1),
            snapshots: Mutex::new(BTreeMap::new()),
            lock_manager: Arc::new(lock_manager),
            log: Arc::new(log),
            registry,
            recovered: Mutex::new(HashMap::new()),
        };
        engine.install_column_family(DEFAULT_COLUMN_FAMILY, DEFAULT_COLUMN_FAMILY_NAME)?;
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lock_manager(&self) -> &dyn LockManager {
        self.lock_manager.as_ref()
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    pub fn log(&self) -> &LogWriter {
        &self.log
    }

    /// Copy of the log, oldest segment first; feed it to [`Engine::recover`]
    pub fn log_segments(&self) -> Vec<LogSegment> {
        self.log.segments()
    }

    /// Sequence of the newest published write
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(Ordering::Acquire)
    }

    // =========================================================================
    // Column Families
    // =========================================================================

    pub fn create_column_family(&self, name: &str) -> Result<ColumnFamilyId> {
        let _write_guard = self.write_lock.lock();
        let id = {
            let cfs = self.column_families.read();
            if cfs.by_name.contains_key(name) {
                return Err(KestrelError::invalid(format!(
                    "column family '{}' already exists",
                    name
                )));
            }
            cfs.next_id
        };
        self.log.write(&LogRecord::ColumnFamily {
            id,
            name: name.to_string(),
        })?;
        self.install_column_family(id, name)?;
        tracing::info!(cf = id, name, "created column family");
        Ok(id)
    }

    fn install_column_family(&self, id: ColumnFamilyId, name: &str) -> Result<()> {
        let active = self.new_memtable(self.latest_sequence())?;
        let mut cfs = self.column_families.write();
        if cfs.by_id.contains_key(&id) || cfs.by_name.contains_key(name) {
            return Err(KestrelError::invalid(format!(
                "column family '{}' ({}) already exists",
                name, id
            )));
        }
        cfs.by_name.insert(name.to_string(), id);
        cfs.by_id.insert(
            id,
            Arc::new(ColumnFamilyData {
                id,
                name: name.to_string(),
                memtables: RwLock::new(MemTableList {
                    active,
                    immutables: Vec::new(),
                }),
            }),
        );
        cfs.next_id = cfs.next_id.max(id + 1);
        Ok(())
    }

    pub fn column_family_id(&self, name: &str) -> Option<ColumnFamilyId> {
        self.column_families.read().by_name.get(name).copied()
    }

    pub fn column_family(&self, id: ColumnFamilyId) -> Result<Arc<ColumnFamilyData<C>>> {
        self.column_families
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| KestrelError::invalid(format!("column family {} does not exist", id)))
    }

    fn new_memtable(&self, earliest_seq: SequenceNumber) -> Result<Arc<MemTable<C>>> {
        let id = self.next_memtable_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MemTable::new(id, &self.config, earliest_seq)?))
    }

    /// Make the active memtable of `cf` immutable and start a new one
    pub fn switch_memtable(&self, cf: ColumnFamilyId) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        let cfd = self.column_family(cf)?;
        self.switch_memtable_locked(&cfd)
    }

    /// Caller holds `write_lock`
    fn switch_memtable_locked(&self, cfd: &ColumnFamilyData<C>) -> Result<()> {
        let fresh = self.new_memtable(self.latest_sequence() + 1)?;
        let mut list = cfd.memtables.write();
        let old = std::mem::replace(&mut list.active, fresh);
        old.mark_immutable();
        tracing::info!(
            cf = cfd.id,
            memtable = old.id(),
            entries = old.num_entries(),
            memory = old.approximate_memory_usage(),
            immutables = list.immutables.len() + 1,
            "switched memtable"
        );
        list.immutables.insert(0, old);
        Ok(())
    }

    /// Switch every active memtable that asked for a flush. Caller holds
    /// `write_lock`.
    fn maybe_switch_memtables(&self) -> Result<()> {
        let cfds: Vec<_> = self.column_families.read().by_id.values().cloned().collect();
        for cfd in cfds {
            let active = cfd.active_memtable();
            if active.should_schedule_flush() && active.mark_flush_scheduled() {
                self.switch_memtable_locked(&cfd)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_cf(DEFAULT_COLUMN_FAMILY, key, value)
    }

    pub fn put_cf(&self, cf: ColumnFamilyId, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(cf, key, value);
        self.write(&batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_cf(DEFAULT_COLUMN_FAMILY, key)
    }

    pub fn delete_cf(&self, cf: ColumnFamilyId, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(cf, key);
        self.write(&batch)
    }

    pub fn single_delete(&self, key: &[u8]) -> Result<()> {
        self.single_delete_cf(DEFAULT_COLUMN_FAMILY, key)
    }

    pub fn single_delete_cf(&self, cf: ColumnFamilyId, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.single_delete(cf, key);
        self.write(&batch)
    }

    /// Delete every key in `[begin, end)`
    pub fn delete_range(&self, cf: ColumnFamilyId, begin: &[u8], end: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_range(cf, begin, end);
        self.write(&batch)
    }

    pub fn merge(&self, key: &[u8], operand: &[u8]) -> Result<()> {
        self.merge_cf(DEFAULT_COLUMN_FAMILY, key, operand)
    }

    pub fn merge_cf(&self, cf: ColumnFamilyId, key: &[u8], operand: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.merge(cf, key, operand);
        self.write(&batch)
    }

    /// Apply `batch` atomically.
    ///
    /// Every key is locked first, so a plain write waits for (or times out
    /// against) transactions holding any of them.
    pub fn write(&self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.validate_batch(batch)?;
        let req = LockRequest::new(next_transaction_id(), self.config.default_lock_timeout);
        let locks = lock_batch(self.lock_manager(), &req, batch)?;
        let result = self.write_locked(batch);
        locks.unlock(self.lock_manager());
        result.map(|_| ())
    }

    /// Apply a batch whose keys the caller already holds locks on.
    /// Returns the sequence of its first operation.
    pub(crate) fn write_locked(&self, batch: &WriteBatch) -> Result<SequenceNumber> {
        self.validate_batch(batch)?;
        self.write_impl(&[batch], |sequence| LogRecord::Batch {
            sequence,
            batch: batch.clone(),
        })
    }

    fn validate_batch(&self, batch: &WriteBatch) -> Result<()> {
        for op in batch.ops() {
            self.column_family(op.column_family())?;
            if let BatchOp::DeleteRange { begin, end, .. } = op {
                if C::compare(begin, end).is_gt() {
                    return Err(KestrelError::invalid(
                        "delete range start must not sort after its end",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Log `record` and insert `batches` back to back, all under
    /// `write_lock`. Sequences are consumed even when an insert fails part
    /// way, so a retry never collides with a half-applied batch.
    fn write_impl<F>(&self, batches: &[&WriteBatch], record: F) -> Result<SequenceNumber>
    where
        F: FnOnce(SequenceNumber) -> LogRecord,
    {
        let _write_guard = self.write_lock.lock();
        let count: u64 = batches.iter().map(|b| b.count() as u64).sum();
        let first = self.latest_sequence() + 1;

        self.log.write(&record(first))?;
        let applied = self.insert_batches(first, batches);
        self.last_sequence.store(first + count - 1, Ordering::Release);
        self.maybe_switch_memtables()?;

        if let Err(e) = &applied {
            tracing::error!(first, count, error = %e, "batch partially applied");
        }
        applied.map(|_| first)
    }

    fn insert_batches(&self, first: SequenceNumber, batches: &[&WriteBatch]) -> Result<()> {
        let mut inserter = MemTableInserter::new(self, first);
        for batch in batches {
            batch.iterate(&mut inserter)?;
        }
        Ok(())
    }

    /// Replay logged batches at their original sequences
    fn replay(&self, first: SequenceNumber, batches: &[&WriteBatch]) -> Result<()> {
        let _write_guard = self.write_lock.lock();
        let count: u64 = batches.iter().map(|b| b.count() as u64).sum();
        self.insert_batches(first, batches)?;
        if count > 0 {
            self.last_sequence
                .fetch_max(first + count - 1, Ordering::AcqRel);
        }
        self.maybe_switch_memtables()
    }

    // =========================================================================
    // Two-phase Commit Support
    // =========================================================================

    /// Log a prepared section and retain its segment. Returns the segment.
    pub(crate) fn log_prepare(&self, name: &str, batch: &WriteBatch) -> Result<u64> {
        self.validate_batch(batch)?;
        let log_number = self.log.write(&LogRecord::Prepare {
            name: name.to_string(),
            batch: batch.clone(),
        })?;
        self.log.retain_log(log_number);
        Ok(log_number)
    }

    /// Write the commit marker and apply the prepared batch followed by the
    /// commit-time batch
    pub(crate) fn commit_prepared(
        &self,
        name: &str,
        batch: &WriteBatch,
        commit_time_batch: &WriteBatch,
        log_number: Option<u64>,
    ) -> Result<SequenceNumber> {
        self.validate_batch(commit_time_batch)?;
        let first = self.write_impl(&[batch, commit_time_batch], |sequence| LogRecord::Commit {
            name: name.to_string(),
            sequence,
            commit_time_batch: commit_time_batch.clone(),
        })?;
        if let Some(n) = log_number {
            self.log.release_log(n);
        }
        Ok(first)
    }

    pub(crate) fn log_rollback(&self, name: &str, log_number: Option<u64>) -> Result<()> {
        self.log.write(&LogRecord::Rollback {
            name: name.to_string(),
        })?;
        if let Some(n) = log_number {
            self.log.release_log(n);
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_cf(&ReadOptions::default(), DEFAULT_COLUMN_FAMILY, key)
    }

    /// Point read, newest memtable first
    pub fn get_cf(&self, opts: &ReadOptions, cf: ColumnFamilyId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cfd = self.column_family(cf)?;
        let snapshot = opts.snapshot.unwrap_or_else(|| self.latest_sequence());
        let lookup = LookupKey::new(key, snapshot);
        let merge_operator = self.config.merge_operator.as_deref();

        let mut ctx = GetContext::default();
        for mem in cfd.memtables() {
            match mem.get(&lookup, &mut ctx, merge_operator, None)? {
                GetOutcome::Found(value) => return Ok(Some(value)),
                GetOutcome::Deleted => return Ok(None),
                GetOutcome::MergeInProgress | GetOutcome::NotFound => {}
            }
        }
        finish_pending(merge_operator, &ctx.merge, key)
    }

    /// Point reads for several keys of one column family, in key order of
    /// `keys`. Once returned values pass `opts.value_size_soft_limit`, the
    /// remaining keys fail with `Aborted`.
    pub fn multi_get(
        &self,
        opts: &ReadOptions,
        cf: ColumnFamilyId,
        keys: &[&[u8]],
    ) -> Result<Vec<Result<Option<Vec<u8>>>>> {
        let cfd = self.column_family(cf)?;
        let snapshot = opts.snapshot.unwrap_or_else(|| self.latest_sequence());
        let merge_operator = self.config.merge_operator.as_deref();

        let mut batch = MultiGetBatch::new(keys, snapshot, opts.value_size_soft_limit);
        for mem in cfd.memtables() {
            mem.multi_get(&mut batch, merge_operator, None);
            if batch.is_done() {
                break;
            }
        }

        Ok(batch
            .keys
            .into_iter()
            .map(|k| match k.outcome {
                Some(Ok(GetOutcome::Found(value))) => Ok(Some(value)),
                Some(Ok(GetOutcome::Deleted)) => Ok(None),
                Some(Err(e)) => Err(e),
                Some(Ok(_)) | None => finish_pending(merge_operator, &k.ctx.merge, k.lookup.user_key()),
            })
            .collect())
    }

    /// Pin the memtables of `cf` for iteration at `opts.snapshot`
    pub fn view(&self, opts: &ReadOptions, cf: ColumnFamilyId) -> Result<ReadView<C>> {
        let cfd = self.column_family(cf)?;
        Ok(ReadView {
            memtables: cfd.memtables(),
            snapshot: opts.snapshot.unwrap_or_else(|| self.latest_sequence()),
            merge_operator: self.config.merge_operator.clone(),
        })
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Pin the current sequence; released when the handle drops
    pub fn snapshot(&self) -> Snapshot<'_, C> {
        let mut snapshots = self.snapshots.lock();
        let sequence = self.latest_sequence();
        *snapshots.entry(sequence).or_insert(0) += 1;
        Snapshot {
            engine: self,
            sequence,
        }
    }

    fn release_snapshot(&self, sequence: SequenceNumber) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&sequence);
            }
        }
    }

    pub fn oldest_snapshot(&self) -> Option<SequenceNumber> {
        self.snapshots.lock().keys().next().copied()
    }

    pub fn num_snapshots(&self) -> usize {
        self.snapshots.lock().values().sum()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin_transaction(&self, options: &TransactionOptions) -> Transaction<'_, C> {
        Transaction::new(self, options)
    }

    /// Fail with `Busy` if `key` was written after `snapshot_seq`.
    ///
    /// A column family keeps every memtable it ever had, so its history is
    /// complete from creation on. A snapshot older than the column family
    /// itself saw none of its keys.
    pub fn check_key_for_conflicts(
        &self,
        cf: ColumnFamilyId,
        key: &[u8],
        snapshot_seq: SequenceNumber,
    ) -> Result<()> {
        let memtables = self.column_family(cf)?.memtables();
        for mem in &memtables {
            if let Some(seq) = mem.get_latest_sequence_for_key(key)? {
                if seq > snapshot_seq {
                    return Err(KestrelError::Busy(format!(
                        "write conflict: key written at {} after snapshot {}",
                        seq, snapshot_seq
                    )));
                }
                return Ok(());
            }
        }
        Ok(())
    }

    /// Steal the locks of transaction `id` if it has expired
    pub fn try_steal_expired_locks(&self, id: TransactionId) -> bool {
        self.registry.try_steal_expired_locks(id)
    }

    /// Move every expired, unprepared transaction to `LOCKS_STOLEN`.
    /// Returns how many were stolen from.
    pub fn reap_expired_transactions(&self) -> usize {
        let expired = self.registry.expired_transactions();
        expired
            .into_iter()
            .filter(|id| self.registry.try_steal_expired_locks(*id))
            .count()
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Rebuild an engine from log segments.
    ///
    /// Plain batches are applied at their logged sequences. A prepared
    /// section is applied when its commit marker is seen and dropped on a
    /// rollback marker. Sections with neither stay pending: their keys are
    /// locked and their segments retained until [`commit_recovered`] or
    /// [`rollback_recovered`] resolves them.
    ///
    /// [`commit_recovered`]: Engine::commit_recovered
    /// [`rollback_recovered`]: Engine::rollback_recovered
    pub fn recover(config: Config, segments: Vec<LogSegment>) -> Result<Self> {
        let (entries, result) = LogRecovery::recover(&segments);

        // keep only the valid prefix so a later recovery does not stop at
        // the same corruption and lose what is written after it
        let mut kept: Vec<LogSegment> = Vec::new();
        for (number, entry) in &entries {
            if kept.last().map_or(true, |s| s.number != *number) {
                kept.push(LogSegment {
                    number: *number,
                    data: Vec::new(),
                });
            }
            if let Some(segment) = kept.last_mut() {
                segment.data.extend_from_slice(&entry.serialize()?);
            }
        }
        if kept.is_empty() {
            if let Some(last) = segments.last() {
                kept.push(LogSegment {
                    number: last.number,
                    data: Vec::new(),
                });
            }
        }
        let log = LogWriter::from_segments(config.max_log_segment_size, kept, result.last_lsn + 1);
        let engine = Self::with_log(config, log)?;

        let mut prepared: HashMap<String, (WriteBatch, u64)> = HashMap::new();
        for (segment, entry) in entries {
            match entry.record {
                LogRecord::ColumnFamily { id, name } => engine.install_column_family(id, &name)?,
                LogRecord::Batch { sequence, batch } => engine.replay(sequence, &[&batch])?,
                LogRecord::Prepare { name, batch } => {
                    prepared.insert(name, (batch, segment));
                }
                LogRecord::Commit {
                    name,
                    sequence,
                    commit_time_batch,
                } => {
                    let batch = match prepared.remove(&name) {
                        Some((batch, _)) => batch,
                        None => {
                            tracing::warn!(name = %name, "commit marker without prepared section");
                            WriteBatch::new()
                        }
                    };
                    engine.replay(sequence, &[&batch, &commit_time_batch])?;
                }
                LogRecord::Rollback { name } => {
                    prepared.remove(&name);
                }
            }
        }

        for (name, (batch, log_number)) in prepared {
            let txn_id = next_transaction_id();
            let req = LockRequest::new(txn_id, std::time::Duration::ZERO);
            let locks = lock_batch(engine.lock_manager(), &req, &batch)?;
            engine.registry.register_name(&name, txn_id)?;
            engine.log.retain_log(log_number);
            tracing::info!(name = %name, log_number, ops = batch.count(), "recovered prepared transaction");
            engine.recovered.lock().insert(
                name,
                RecoveredTransaction {
                    batch,
                    log_number,
                    txn_id,
                    locks,
                },
            );
        }
        Ok(engine)
    }

    /// Names of prepared transactions awaiting resolution, sorted: those
    /// found pending at recovery and those dropped while prepared
    pub fn recovered_prepared_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.recovered.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn commit_recovered(&self, name: &str) -> Result<()> {
        let txn = self.take_recovered(name)?;
        let result = self.commit_prepared(name, &txn.batch, &WriteBatch::new(), Some(txn.log_number));
        if let Err(e) = result {
            self.recovered.lock().insert(name.to_string(), txn);
            return Err(e);
        }
        self.finish_recovered(name, txn);
        Ok(())
    }

    pub fn rollback_recovered(&self, name: &str) -> Result<()> {
        let txn = self.take_recovered(name)?;
        if let Err(e) = self.log_rollback(name, Some(txn.log_number)) {
            self.recovered.lock().insert(name.to_string(), txn);
            return Err(e);
        }
        self.finish_recovered(name, txn);
        Ok(())
    }

    /// Keep a prepared transaction whose handle was dropped pending, with its
    /// locks held and its segment retained, until it is resolved by name
    pub(crate) fn adopt_prepared(
        &self,
        name: String,
        batch: WriteBatch,
        log_number: u64,
        txn_id: TransactionId,
        locks: LockedBatch,
    ) {
        tracing::warn!(
            name = %name,
            txn = txn_id,
            log_number,
            keys = locks.num_keys(),
            "prepared transaction dropped unresolved; kept pending"
        );
        self.recovered.lock().insert(
            name,
            RecoveredTransaction {
                batch,
                log_number,
                txn_id,
                locks,
            },
        );
    }

    fn take_recovered(&self, name: &str) -> Result<RecoveredTransaction> {
        self.recovered.lock().remove(name).ok_or(KestrelError::NotFound)
    }

    fn finish_recovered(&self, name: &str, txn: RecoveredTransaction) {
        txn.locks.unlock(self.lock_manager());
        self.registry.unregister_name(name);
        self.registry.unregister_expirable(txn.txn_id);
        tracing::debug!(name, txn = txn.txn_id, "resolved recovered transaction");
    }
}

fn finish_pending(
    merge_operator: Option<&dyn MergeOperator>,
    operands: &MergeContext,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    if operands.is_empty() {
        Ok(None)
    } else {
        resolve(merge_operator, operands, key, None).map(Some)
    }
}

// =============================================================================
// MemTable Inserter
// =============================================================================

/// Applies batch operations to the active memtables, one sequence each
struct MemTableInserter<'e, C: Comparator> {
    engine: &'e Engine<C>,
    sequence: SequenceNumber,
    concurrent: bool,
    memtables: HashMap<ColumnFamilyId, Arc<MemTable<C>>>,
    hints: HashMap<ColumnFamilyId, InsertHint>,
}

impl<'e, C: Comparator> MemTableInserter<'e, C> {
    fn new(engine: &'e Engine<C>, first: SequenceNumber) -> Self {
        Self {
            engine,
            sequence: first,
            concurrent: engine.config.allow_concurrent_memtable_write,
            memtables: HashMap::new(),
            hints: HashMap::new(),
        }
    }

    fn add(
        &mut self,
        mem: &MemTable<C>,
        cf: ColumnFamilyId,
        seq: SequenceNumber,
        value_type: ValueType,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let hint = self.hints.entry(cf).or_default();
        mem.add_with_hint(seq, value_type, key, value, self.concurrent, hint)
    }

    /// Active memtable of `cf` plus the sequence for the next operation
    fn next(&mut self, cf: ColumnFamilyId) -> Result<(Arc<MemTable<C>>, SequenceNumber)> {
        let seq = self.sequence;
        self.sequence += 1;
        let mem = match self.memtables.get(&cf) {
            Some(mem) => Arc::clone(mem),
            None => {
                let mem = self.engine.column_family(cf)?.active_memtable();
                self.memtables.insert(cf, Arc::clone(&mem));
                mem
            }
        };
        Ok((mem, seq))
    }
}

impl<C: Comparator> WriteBatchHandler for MemTableInserter<'_, C> {
    fn put(&mut self, cf: ColumnFamilyId, key: &[u8], value: &[u8]) -> Result<()> {
        let (mem, seq) = self.next(cf)?;
        let engine = self.engine;
        let config = &engine.config;
        if !config.inplace_update_support {
            return self.add(&mem, cf, seq, ValueType::Value, key, value);
        }
        let Some(callback) = &config.inplace_callback else {
            return mem.update(seq, key, value);
        };

        if mem.update_callback(seq, key, value, |existing, delta| callback(Some(existing), delta))? {
            return Ok(());
        }
        // newest version is not a plain value in this memtable: read through
        let existing = engine.get_cf(&ReadOptions::at(seq - 1), cf, key)?;
        match callback(existing.as_deref(), value) {
            UpdateStatus::Failed => Ok(()),
            UpdateStatus::UpdatedInPlace(v) | UpdateStatus::Updated(v) => {
                self.add(&mem, cf, seq, ValueType::Value, key, &v)
            }
        }
    }

    fn delete(&mut self, cf: ColumnFamilyId, key: &[u8]) -> Result<()> {
        let (mem, seq) = self.next(cf)?;
        self.add(&mem, cf, seq, ValueType::Deletion, key, b"")
    }

    fn single_delete(&mut self, cf: ColumnFamilyId, key: &[u8]) -> Result<()> {
        let (mem, seq) = self.next(cf)?;
        self.add(&mem, cf, seq, ValueType::SingleDeletion, key, b"")
    }

    fn delete_range(&mut self, cf: ColumnFamilyId, begin: &[u8], end: &[u8]) -> Result<()> {
        let (mem, seq) = self.next(cf)?;
        self.add(&mem, cf, seq, ValueType::RangeDeletion, begin, end)
    }

    fn merge(&mut self, cf: ColumnFamilyId, key: &[u8], value: &[u8]) -> Result<()> {
        let (mem, seq) = self.next(cf)?;
        self.add(&mem, cf, seq, ValueType::Merge, key, value)
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// A pinned read sequence
pub struct Snapshot<'a, C: Comparator = BytewiseComparator> {
    engine: &'a Engine<C>,
    sequence: SequenceNumber,
}

impl<C: Comparator> Snapshot<'_, C> {
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions::at(self.sequence)
    }
}

impl<C: Comparator> Drop for Snapshot<'_, C> {
    fn drop(&mut self) {
        self.engine.release_snapshot(self.sequence);
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Memtables of one column family pinned at a sequence
pub struct ReadView<C: Comparator = BytewiseComparator> {
    memtables: Vec<Arc<MemTable<C>>>,
    snapshot: SequenceNumber,
    merge_operator: Option<Arc<dyn MergeOperator>>,
}

struct RangeTombstone {
    start: Vec<u8>,
    end: Vec<u8>,
    seq: SequenceNumber,
}

impl<C: Comparator> ReadView<C> {
    pub fn snapshot(&self) -> SequenceNumber {
        self.snapshot
    }

    /// User-facing cursor over the view
    pub fn iter(&self) -> DbIterator<'_, C> {
        let mut status = None;
        let mut tombstones = Vec::new();
        for mem in &self.memtables {
            let mut it = mem.range_tombstone_iter();
            it.seek_to_first();
            while it.valid() {
                match ParsedInternalKey::parse(it.key()) {
                    Ok(p) if p.sequence <= self.snapshot => tombstones.push(RangeTombstone {
                        start: p.user_key.to_vec(),
                        end: it.value().to_vec(),
                        seq: p.sequence,
                    }),
                    Ok(_) => {}
                    Err(e) => {
                        status.get_or_insert(e);
                    }
                }
                it.next();
            }
            if let Err(e) = it.status() {
                status.get_or_insert(e);
            }
        }

        let children: Vec<Box<dyn InternalIterator + '_>> = self
            .memtables
            .iter()
            .map(|m| Box::new(m.iter()) as Box<dyn InternalIterator + '_>)
            .collect();
        DbIterator {
            inner: MergingIterator::new(children),
            tombstones,
            snapshot: self.snapshot,
            merge_operator: self.merge_operator.as_deref(),
            key: Vec::new(),
            value: Vec::new(),
            valid: false,
            status,
        }
    }
}

/// Forward cursor over user keys: one entry per live key, with its newest
/// visible value (merges resolved). Deleted and range-deleted keys are hidden.
pub struct DbIterator<'a, C: Comparator = BytewiseComparator> {
    inner: MergingIterator<'a, InternalKeyComparator<C>>,
    tombstones: Vec<RangeTombstone>,
    snapshot: SequenceNumber,
    merge_operator: Option<&'a dyn MergeOperator>,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
    status: Option<KestrelError>,
}

impl<'a, C: Comparator> DbIterator<'a, C> {
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
        self.find_next_visible(None);
    }

    /// Position at the first live key >= `target`
    pub fn seek(&mut self, target: &[u8]) {
        let lookup = LookupKey::new(target, self.snapshot);
        self.inner.seek(lookup.internal_key());
        self.find_next_visible(None);
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        let current = std::mem::take(&mut self.key);
        self.find_next_visible(Some(current));
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => self.inner.status(),
        }
    }

    fn covering_seq(&self, user_key: &[u8]) -> SequenceNumber {
        self.tombstones
            .iter()
            .filter(|t| C::compare(&t.start, user_key).is_le() && C::compare(user_key, &t.end).is_lt())
            .map(|t| t.seq)
            .max()
            .unwrap_or(0)
    }

    fn fail(&mut self, e: KestrelError) {
        self.valid = false;
        self.status.get_or_insert(e);
    }

    /// Advance `inner` to the newest visible version of the next live user
    /// key, skipping remaining versions of `skip`
    fn find_next_visible(&mut self, mut skip: Option<Vec<u8>>) {
        self.valid = false;
        if self.status.is_some() {
            return;
        }
        while self.inner.valid() {
            let (user_key, sequence, value_type) = match ParsedInternalKey::parse(self.inner.key()) {
                Ok(p) => (p.user_key.to_vec(), p.sequence, p.value_type),
                Err(e) => return self.fail(e),
            };
            if sequence > self.snapshot
                || skip.as_deref().is_some_and(|s| C::compare(&user_key, s).is_eq())
            {
                self.inner.next();
                continue;
            }

            let deleted = self.covering_seq(&user_key) > sequence
                || matches!(
                    value_type,
                    ValueType::Deletion | ValueType::SingleDeletion | ValueType::RangeDeletion
                );
            if deleted {
                skip = Some(user_key);
                self.inner.next();
                continue;
            }

            match value_type {
                ValueType::Merge => match self.merge_versions(&user_key) {
                    Ok(value) => self.value = value,
                    Err(e) => return self.fail(e),
                },
                _ => self.value = self.inner.value().to_vec(),
            }
            self.key = user_key;
            self.valid = true;
            return;
        }
        if let Err(e) = self.inner.status() {
            self.fail(e);
        }
    }

    /// Fold the merge operands of `user_key`, starting at the current entry,
    /// down to a base value, a tombstone, or the key's last version
    fn merge_versions(&mut self, user_key: &[u8]) -> Result<Vec<u8>> {
        let mut operands = MergeContext::new();
        let mut base = None;
        while self.inner.valid() {
            let parsed = ParsedInternalKey::parse(self.inner.key())?;
            if !C::compare(parsed.user_key, user_key).is_eq() {
                break;
            }
            if self.covering_seq(user_key) > parsed.sequence {
                break;
            }
            match parsed.value_type {
                ValueType::Merge => operands.push(self.inner.value().to_vec()),
                ValueType::Value | ValueType::BlobIndex => {
                    base = Some(self.inner.value().to_vec());
                    break;
                }
                _ => break,
            }
            self.inner.next();
        }
        self.inner.status()?;
        resolve(self.merge_operator, &operands, user_key, base.as_deref())
    }
}
