//! MemTable implementation
//!
//! Two lock-free skiplists (point entries and range tombstones) whose keys and
//! values are views into arena blocks. Values sit behind a striped lock table
//! only when in-place updates are enabled.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::utils::{Backoff, CachePadded};
use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::config::Config;
use crate::error::{KestrelError, Result};
use crate::key::{
    decode_entry, decode_length_prefixed, encode_entry, encoded_entry_len, extract_trailer,
    extract_user_key, LookupKey, ParsedInternalKey, SequenceNumber, ValueType,
    MAX_SEQUENCE_NUMBER, TRAILER_SIZE,
};
use crate::merge_operator::{resolve, MergeOperator};
use crate::slice_transform::SliceTransform;

use super::arena::Arena;
use super::bloom::MemTableBloom;
use super::iterator::{MemTableIterator, RangeTombstoneIterator};
use super::range_del::FragmentedTombstones;
use super::{GetContext, GetOutcome, MultiGetBatch, ReadCallback, UpdateStatus};

/// Memory may exceed the write buffer by this fraction of one arena block
/// before a flush is forced
const ALLOW_OVER_ALLOCATION_RATIO: f64 = 0.6;

/// Estimated skiplist node cost per entry, on top of the arena bytes
const SKIPLIST_ENTRY_OVERHEAD: usize = 64;

/// `first_seqno` before any insert; above every valid sequence, so 0 stays usable
const UNSET_SEQUENCE: u64 = u64::MAX;

/// Process-wide memtable identity for insert hints; caller-chosen ids may repeat
static NEXT_TABLE_TOKEN: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Insert Hint
// =============================================================================

/// Per-writer memo for prefix-clustered inserts.
///
/// Remembers the last prefix this writer put into a memtable's filter, so a
/// run of keys sharing that prefix updates the filter once. Bound to one
/// memtable; handing it to another simply starts over.
#[derive(Debug, Default)]
pub struct InsertHint {
    table: u64,
    prefix: Vec<u8>,
    hits: u64,
}

impl InsertHint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter updates skipped thanks to this hint
    pub fn hits(&self) -> u64 {
        self.hits
    }

    fn covers(&self, table: u64, prefix: &[u8]) -> bool {
        self.table == table && self.prefix == prefix
    }

    fn remember(&mut self, table: u64, prefix: &[u8]) {
        self.table = table;
        self.prefix.clear();
        self.prefix.extend_from_slice(prefix);
    }
}

// =============================================================================
// Skiplist Key / Value
// =============================================================================

/// Internal key stored in the skiplists, ordered by user key ascending then
/// sequence descending. The type byte does not take part in the order, so a
/// second entry with the same `(user_key, seq)` collides on insert.
pub(crate) struct MemKey<C> {
    ikey: Bytes,
    _cmp: PhantomData<fn() -> C>,
}

impl<C> MemKey<C> {
    fn new(ikey: Bytes) -> Self {
        Self {
            ikey,
            _cmp: PhantomData,
        }
    }

    pub(crate) fn from_slice(ikey: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(ikey))
    }

    pub(crate) fn internal_key(&self) -> &[u8] {
        &self.ikey
    }

    pub(crate) fn user_key(&self) -> &[u8] {
        extract_user_key(&self.ikey)
    }

    fn sequence(&self) -> SequenceNumber {
        extract_trailer(&self.ikey) >> 8
    }
}

impl<C: Comparator> Ord for MemKey<C> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        C::compare(self.user_key(), other.user_key())
            .then_with(|| other.sequence().cmp(&self.sequence()))
    }
}

impl<C: Comparator> PartialOrd for MemKey<C> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<C: Comparator> PartialEq for MemKey<C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl<C: Comparator> Eq for MemKey<C> {}

/// Length-prefixed value bytes (`varint32(len) | value`) in the arena.
///
/// Written after insertion only by in-place updates, which hold the key's
/// stripe lock exclusively.
pub(crate) struct ValueSlot {
    buf: UnsafeCell<BytesMut>,
}

// SAFETY: the buffer is mutated only through `bytes_mut`, whose callers hold
// the owning key's stripe write lock. When in-place updates are enabled every
// reader holds the same stripe's read lock; when they are disabled nothing
// mutates the buffer after insertion.
unsafe impl Sync for ValueSlot {}

impl ValueSlot {
    fn new(buf: BytesMut) -> Self {
        Self {
            buf: UnsafeCell::new(buf),
        }
    }

    /// # Safety
    /// No writer may run concurrently (see the `Sync` impl).
    unsafe fn bytes(&self) -> &[u8] {
        &*self.buf.get()
    }

    /// # Safety
    /// Caller holds the key's stripe write lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self) -> &mut BytesMut {
        &mut *self.buf.get()
    }
}

pub(crate) type Table<C> = SkipMap<MemKey<C>, ValueSlot>;

// =============================================================================
// Flush State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlushState {
    NotRequested = 0,
    Requested = 1,
    Scheduled = 2,
}

impl FlushState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => FlushState::Requested,
            2 => FlushState::Scheduled,
            _ => FlushState::NotRequested,
        }
    }
}

// =============================================================================
// MemTable
// =============================================================================

/// In-memory sorted write buffer for one column family
pub struct MemTable<C: Comparator = BytewiseComparator> {
    id: u64,
    token: u64,
    arena: Arena,
    table: Table<C>,
    range_del_table: Table<C>,
    is_range_del_table_empty: AtomicBool,
    /// Rebuilt on the first covering lookup after a tombstone lands
    range_del_cache: RwLock<Option<Arc<FragmentedTombstones<C>>>>,

    bloom: Option<MemTableBloom>,
    prefix_extractor: Option<Arc<dyn SliceTransform>>,
    whole_key_filtering: bool,

    inplace_update_support: bool,
    locks: Box<[RwLock<()>]>,
    paranoid_checks: bool,

    write_buffer_size: AtomicUsize,
    approximate_memory_usage: AtomicUsize,

    num_entries: CachePadded<AtomicU64>,
    data_size: CachePadded<AtomicU64>,
    num_deletes: CachePadded<AtomicU64>,
    num_range_deletes: AtomicU64,
    /// Smallest sequence inserted; `UNSET_SEQUENCE` while empty
    first_seqno: AtomicU64,
    /// Lower bound on every sequence this memtable holds or will hold
    earliest_seqno: AtomicU64,

    flush_state: AtomicU8,
    immutable: AtomicBool,
}

impl<C: Comparator> MemTable<C> {
    /// Create an empty memtable.
    ///
    /// `earliest_seq` is the smallest sequence that may be written into it,
    /// or [`MAX_SEQUENCE_NUMBER`] when unknown.
    pub fn new(id: u64, config: &Config, earliest_seq: SequenceNumber) -> Result<Self> {
        let bloom = if config.memtable_prefix_bloom_size_ratio > 0.0
            && (config.prefix_extractor.is_some() || config.memtable_whole_key_filtering)
        {
            let bits = (config.write_buffer_size as f64
                * config.memtable_prefix_bloom_size_ratio.min(0.25)
                * 8.0) as usize;
            Some(MemTableBloom::new(bits)?)
        } else {
            None
        };

        let locks = if config.inplace_update_support {
            (0..config.inplace_update_num_locks.max(1))
                .map(|_| RwLock::new(()))
                .collect()
        } else {
            Vec::new().into_boxed_slice()
        };

        Ok(Self {
            id,
            token: NEXT_TABLE_TOKEN.fetch_add(1, Ordering::Relaxed),
            arena: Arena::new(config.effective_arena_block_size()),
            table: SkipMap::new(),
            range_del_table: SkipMap::new(),
            is_range_del_table_empty: AtomicBool::new(true),
            range_del_cache: RwLock::new(None),
            bloom,
            prefix_extractor: config.prefix_extractor.clone(),
            whole_key_filtering: config.memtable_whole_key_filtering,
            inplace_update_support: config.inplace_update_support,
            locks,
            paranoid_checks: config.paranoid_memtable_checks,
            write_buffer_size: AtomicUsize::new(config.write_buffer_size),
            approximate_memory_usage: AtomicUsize::new(0),
            num_entries: CachePadded::new(AtomicU64::new(0)),
            data_size: CachePadded::new(AtomicU64::new(0)),
            num_deletes: CachePadded::new(AtomicU64::new(0)),
            num_range_deletes: AtomicU64::new(0),
            first_seqno: AtomicU64::new(UNSET_SEQUENCE),
            earliest_seqno: AtomicU64::new(earliest_seq),
            flush_state: AtomicU8::new(FlushState::NotRequested as u8),
            immutable: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // -------------------------------------------------------------------------
    // Write Path
    // -------------------------------------------------------------------------

    /// Insert one versioned record.
    ///
    /// `concurrent` selects the multi-writer path: counters are updated with
    /// atomic read-modify-writes and the sequence bounds with CAS loops.
    /// Without it the caller guarantees it is the only writer.
    ///
    /// Fails with `TryAgain` if an entry with the same `(key, seq)` exists.
    pub fn add(
        &self,
        seq: SequenceNumber,
        value_type: ValueType,
        key: &[u8],
        value: &[u8],
        concurrent: bool,
    ) -> Result<()> {
        self.insert(seq, value_type, key, value, concurrent, None)
    }

    /// [`add`](Self::add) for a writer inserting runs of keys that share a
    /// prefix. `hint` belongs to the calling writer and is reused across its
    /// inserts; it never changes what is stored, only skips filter work.
    pub fn add_with_hint(
        &self,
        seq: SequenceNumber,
        value_type: ValueType,
        key: &[u8],
        value: &[u8],
        concurrent: bool,
        hint: &mut InsertHint,
    ) -> Result<()> {
        self.insert(seq, value_type, key, value, concurrent, Some(hint))
    }

    fn insert(
        &self,
        seq: SequenceNumber,
        value_type: ValueType,
        key: &[u8],
        value: &[u8],
        concurrent: bool,
        hint: Option<&mut InsertHint>,
    ) -> Result<()> {
        if self.immutable.load(Ordering::Acquire) {
            return Err(KestrelError::invalid("memtable is immutable"));
        }
        if seq > MAX_SEQUENCE_NUMBER {
            return Err(KestrelError::invalid(format!("sequence {} out of range", seq)));
        }

        let encoded_len = encoded_entry_len(key, value);
        let mut buf = self.arena.allocate(encoded_len);
        let value_offset = encode_entry(&mut buf, key, seq, value_type, value)?;
        if self.paranoid_checks {
            self.verify_encoded_entry(&buf, key, seq, value_type, value)?;
        }

        let value_part = buf.split_off(value_offset);
        let key_prefix = buf.len() - key.len() - TRAILER_SIZE;
        let ikey = buf.freeze().slice(key_prefix..);
        let mem_key = MemKey::new(ikey);

        let table = if value_type == ValueType::RangeDeletion {
            &self.range_del_table
        } else {
            &self.table
        };

        let mut inserted = false;
        table.get_or_insert_with(mem_key, || {
            inserted = true;
            ValueSlot::new(value_part)
        });
        if !inserted {
            return Err(KestrelError::TryAgain(format!(
                "entry at sequence {} already exists for key",
                seq
            )));
        }

        self.add_to_filter(key, hint);
        self.record_insert(seq, value_type, encoded_len, concurrent);
        if value_type == ValueType::RangeDeletion {
            self.num_range_deletes.fetch_add(1, Ordering::Release);
            self.is_range_del_table_empty.store(false, Ordering::Release);
        }
        self.update_flush_state();
        Ok(())
    }

    fn verify_encoded_entry(
        &self,
        buf: &[u8],
        key: &[u8],
        seq: SequenceNumber,
        value_type: ValueType,
        value: &[u8],
    ) -> Result<()> {
        let (parsed, decoded_value) = decode_entry(buf)?;
        if parsed.user_key != key
            || parsed.sequence != seq
            || parsed.value_type != value_type
            || decoded_value != value
        {
            return Err(KestrelError::corruption("encoded memtable entry does not match its inputs"));
        }
        Ok(())
    }

    fn record_insert(
        &self,
        seq: SequenceNumber,
        value_type: ValueType,
        encoded_len: usize,
        concurrent: bool,
    ) {
        let is_delete = value_type.is_point_deletion();
        if concurrent {
            self.num_entries.fetch_add(1, Ordering::Relaxed);
            self.data_size.fetch_add(encoded_len as u64, Ordering::Relaxed);
            if is_delete {
                self.num_deletes.fetch_add(1, Ordering::Relaxed);
            }
            cas_min(&self.first_seqno, seq, UNSET_SEQUENCE);
            cas_min(&self.earliest_seqno, seq, MAX_SEQUENCE_NUMBER);
        } else {
            let n = self.num_entries.load(Ordering::Relaxed);
            self.num_entries.store(n + 1, Ordering::Relaxed);
            let d = self.data_size.load(Ordering::Relaxed);
            self.data_size.store(d + encoded_len as u64, Ordering::Relaxed);
            if is_delete {
                let n = self.num_deletes.load(Ordering::Relaxed);
                self.num_deletes.store(n + 1, Ordering::Relaxed);
            }
            let first = self.first_seqno.load(Ordering::Relaxed);
            if seq < first {
                self.first_seqno.store(seq, Ordering::Relaxed);
            }
            let earliest = self.earliest_seqno.load(Ordering::Relaxed);
            if seq < earliest {
                self.earliest_seqno.store(seq, Ordering::Relaxed);
            }
        }
    }

    /// Key the filter is consulted with: the prefix and/or the whole key,
    /// timestamps stripped
    fn add_to_filter(&self, key: &[u8], hint: Option<&mut InsertHint>) {
        let Some(bloom) = &self.bloom else { return };
        let key = strip_timestamp::<C>(key);
        if let Some(prefix) = self.filter_prefix(key) {
            match hint {
                Some(h) if h.covers(self.token, prefix) => h.hits += 1,
                Some(h) => {
                    bloom.add(prefix);
                    h.remember(self.token, prefix);
                }
                None => bloom.add(prefix),
            }
        }
        if self.whole_key_filtering {
            bloom.add(key);
        }
    }

    fn filter_prefix<'k>(&self, key: &'k [u8]) -> Option<&'k [u8]> {
        self.prefix_extractor
            .as_ref()
            .filter(|p| p.in_domain(key))
            .map(|p| p.transform(key))
    }

    /// The key checked against the filter, or `None` when the filter cannot
    /// answer for this key
    fn filter_key<'k>(&self, key: &'k [u8]) -> Option<&'k [u8]> {
        self.bloom.as_ref()?;
        let key = strip_timestamp::<C>(key);
        if self.whole_key_filtering {
            Some(key)
        } else {
            self.filter_prefix(key)
        }
    }

    // -------------------------------------------------------------------------
    // Read Path
    // -------------------------------------------------------------------------

    /// Point read at the lookup key's sequence.
    ///
    /// `ctx` carries merge operands and the covering tombstone sequence across
    /// memtables, newest memtable first. A final outcome (`Found`/`Deleted`)
    /// means older sources need not be consulted.
    pub fn get(
        &self,
        lookup: &LookupKey,
        ctx: &mut GetContext,
        merge_operator: Option<&dyn MergeOperator>,
        callback: Option<&dyn ReadCallback>,
    ) -> Result<GetOutcome> {
        if self.is_empty() {
            return Ok(pending_outcome(ctx));
        }
        let covering = self.max_covering_tombstone_seq(lookup.user_key(), lookup.sequence());
        ctx.max_covering_tombstone_seq = ctx.max_covering_tombstone_seq.max(covering);

        if let (Some(bloom), Some(filter_key)) = (&self.bloom, self.filter_key(lookup.user_key())) {
            if !bloom.may_contain(filter_key) {
                return Ok(pending_outcome(ctx));
            }
        }
        self.get_from_table(lookup, ctx, merge_operator, callback)
    }

    fn get_from_table(
        &self,
        lookup: &LookupKey,
        ctx: &mut GetContext,
        merge_operator: Option<&dyn MergeOperator>,
        callback: Option<&dyn ReadCallback>,
    ) -> Result<GetOutcome> {
        let target = MemKey::<C>::from_slice(lookup.internal_key());
        let user_key = lookup.user_key();
        let mut cursor = self.table.lower_bound(Bound::Included(&target));

        while let Some(entry) = cursor {
            let parsed = ParsedInternalKey::parse(entry.key().internal_key())?;
            if C::compare_without_timestamp(parsed.user_key, user_key) != CmpOrdering::Equal {
                break;
            }
            if let Some(cb) = callback {
                if !cb.is_visible(parsed.sequence) {
                    cursor = entry.next();
                    continue;
                }
            }

            let shadowed = ctx.max_covering_tombstone_seq > parsed.sequence;
            let value_type = match parsed.value_type {
                ValueType::Value | ValueType::BlobIndex | ValueType::Merge if shadowed => {
                    ValueType::RangeDeletion
                }
                t => t,
            };

            match value_type {
                ValueType::Value | ValueType::BlobIndex => {
                    let value = self.read_slot(parsed.user_key, entry.value())?;
                    if ctx.merge.is_empty() {
                        return Ok(GetOutcome::Found(value));
                    }
                    let merged = resolve(merge_operator, &ctx.merge, user_key, Some(&value))?;
                    return Ok(GetOutcome::Found(merged));
                }
                ValueType::Deletion | ValueType::SingleDeletion | ValueType::RangeDeletion => {
                    if ctx.merge.is_empty() {
                        return Ok(GetOutcome::Deleted);
                    }
                    let merged = resolve(merge_operator, &ctx.merge, user_key, None)?;
                    return Ok(GetOutcome::Found(merged));
                }
                ValueType::Merge => {
                    let Some(op) = merge_operator else {
                        return Err(KestrelError::invalid(
                            "merge operand found but no merge operator is configured",
                        ));
                    };
                    let operand = self.read_slot(parsed.user_key, entry.value())?;
                    ctx.merge.push(operand);
                    if op.should_merge(ctx.merge.operands_newest_first()) {
                        let merged = ctx.merge.merge(op, user_key, None)?;
                        return Ok(GetOutcome::Found(merged));
                    }
                }
            }
            cursor = entry.next();
        }
        Ok(pending_outcome(ctx))
    }

    /// Point reads for a batch of keys.
    ///
    /// Keys already resolved by a newer memtable are skipped. The filter is
    /// checked once for the whole batch. Once the materialised value bytes pass
    /// the batch's soft limit, every still-pending key is marked `Aborted`.
    pub fn multi_get(
        &self,
        batch: &mut MultiGetBatch,
        merge_operator: Option<&dyn MergeOperator>,
        callback: Option<&dyn ReadCallback>,
    ) {
        if self.is_empty() {
            return;
        }
        let pending: Vec<usize> = batch.pending().collect();
        let may_contain: Vec<bool> = match &self.bloom {
            Some(bloom) => {
                let filter_keys: Vec<Option<&[u8]>> = pending
                    .iter()
                    .map(|&i| self.filter_key(batch.keys[i].lookup.user_key()))
                    .collect();
                let present: Vec<&[u8]> = filter_keys.iter().flatten().copied().collect();
                let mut checked = bloom.may_contain_batch(&present).into_iter();
                filter_keys
                    .iter()
                    .map(|p| match p {
                        Some(_) => checked.next().unwrap_or(true),
                        None => true,
                    })
                    .collect()
            }
            None => vec![true; pending.len()],
        };

        for (idx, may) in pending.into_iter().zip(may_contain) {
            let key = &mut batch.keys[idx];
            let covering = self.max_covering_tombstone_seq(key.lookup.user_key(), key.lookup.sequence());
            key.ctx.max_covering_tombstone_seq = key.ctx.max_covering_tombstone_seq.max(covering);
            if !may {
                continue;
            }
            match self.get_from_table(&key.lookup, &mut key.ctx, merge_operator, callback) {
                Ok(GetOutcome::Found(value)) => {
                    batch.value_size += value.len();
                    key.outcome = Some(Ok(GetOutcome::Found(value)));
                    if batch.value_size > batch.value_size_soft_limit {
                        tracing::debug!(
                            value_size = batch.value_size,
                            limit = batch.value_size_soft_limit,
                            "multi_get soft limit exceeded, aborting remaining keys"
                        );
                        batch.abort_pending();
                        return;
                    }
                }
                Ok(GetOutcome::Deleted) => key.outcome = Some(Ok(GetOutcome::Deleted)),
                Ok(_) => {}
                Err(e) => key.outcome = Some(Err(e)),
            }
        }
    }

    /// Sequence of the newest write touching `key`, counting range tombstones
    /// that cover it. `None` when this memtable holds nothing for the key.
    pub fn get_latest_sequence_for_key(&self, key: &[u8]) -> Result<Option<SequenceNumber>> {
        let lookup = LookupKey::new(key, MAX_SEQUENCE_NUMBER);
        let target = MemKey::<C>::from_slice(lookup.internal_key());
        let mut latest = None;
        if let Some(entry) = self.table.lower_bound(Bound::Included(&target)) {
            let parsed = ParsedInternalKey::parse(entry.key().internal_key())?;
            if C::compare_without_timestamp(parsed.user_key, key) == CmpOrdering::Equal {
                latest = Some(parsed.sequence);
            }
        }
        let covering = self.max_covering_tombstone_seq(key, MAX_SEQUENCE_NUMBER);
        if covering > 0 {
            latest = Some(latest.map_or(covering, |s: SequenceNumber| s.max(covering)));
        }
        Ok(latest)
    }

    /// Largest sequence among range tombstones visible at `snapshot` that
    /// cover `user_key`; 0 when none do
    pub fn max_covering_tombstone_seq(&self, user_key: &[u8], snapshot: SequenceNumber) -> SequenceNumber {
        if self.is_range_del_table_empty.load(Ordering::Acquire) {
            return 0;
        }
        self.fragmented_tombstones()
            .max_covering_seq(user_key, snapshot)
    }

    /// Cached fragmented view holding at least every tombstone counted so far
    fn fragmented_tombstones(&self) -> Arc<FragmentedTombstones<C>> {
        let version = self.num_range_deletes.load(Ordering::Acquire);
        if let Some(cached) = self.range_del_cache.read().as_ref() {
            if cached.version() == version {
                return Arc::clone(cached);
            }
        }

        let tombstones = self
            .range_del_table
            .iter()
            .filter_map(|entry| {
                let start = entry.key().user_key();
                let end = self.read_slot(start, entry.value()).ok()?;
                Some((start.to_vec(), end, entry.key().sequence()))
            })
            .collect();
        let built = Arc::new(FragmentedTombstones::build(tombstones, version));
        tracing::trace!(
            memtable = self.id,
            tombstones = version,
            fragments = built.num_fragments(),
            "fragmented range tombstones"
        );

        let mut cache = self.range_del_cache.write();
        if cache.as_ref().map_or(true, |c| c.version() < version) {
            *cache = Some(Arc::clone(&built));
        }
        built
    }

    /// Copy a slot's value out, under the stripe read lock when in-place
    /// updates may be rewriting it
    pub(crate) fn read_slot(&self, user_key: &[u8], slot: &ValueSlot) -> Result<Vec<u8>> {
        let _guard = self
            .inplace_update_support
            .then(|| self.stripe(user_key).read());
        // SAFETY: writers hold this key's stripe write lock; we hold its read
        // lock, or in-place updates are disabled.
        let raw = unsafe { slot.bytes() };
        decode_length_prefixed(raw).map(<[u8]>::to_vec)
    }

    // -------------------------------------------------------------------------
    // In-place Updates
    // -------------------------------------------------------------------------

    fn stripe(&self, user_key: &[u8]) -> &RwLock<()> {
        let mut hasher = DefaultHasher::new();
        strip_timestamp::<C>(user_key).hash(&mut hasher);
        let idx = (hasher.finish() % self.locks.len() as u64) as usize;
        &self.locks[idx]
    }

    /// Newest point entry for `key` at or below `seq`, if its user key matches
    fn newest_entry(&self, key: &[u8], seq: SequenceNumber) -> Option<Entry<'_, MemKey<C>, ValueSlot>> {
        let lookup = LookupKey::new(key, seq);
        let target = MemKey::<C>::from_slice(lookup.internal_key());
        self.table
            .lower_bound(Bound::Included(&target))
            .filter(|e| C::compare(e.key().user_key(), key) == CmpOrdering::Equal)
    }

    /// Overwrite the newest value of `key` when the new value fits in its
    /// allocation, otherwise append a new version at `seq`.
    ///
    /// Without in-place update support this always appends.
    pub fn update(&self, seq: SequenceNumber, key: &[u8], value: &[u8]) -> Result<()> {
        if self.inplace_update_support {
            if let Some(entry) = self.newest_entry(key, seq) {
                let parsed = ParsedInternalKey::parse(entry.key().internal_key())?;
                if parsed.value_type == ValueType::Value {
                    let _guard = self.stripe(key).write();
                    // SAFETY: we hold this key's stripe write lock.
                    let slot = unsafe { entry.value().bytes_mut() };
                    if try_overwrite(slot, value)? {
                        return Ok(());
                    }
                }
            }
        }
        self.add(seq, ValueType::Value, key, value, false)
    }

    /// Apply `callback(existing, delta)` to the newest value of `key`.
    ///
    /// Returns `Ok(false)` when the newest version is missing or not a plain
    /// value, leaving the memtable untouched so the caller can fall back to a
    /// regular write.
    pub fn update_callback<F>(
        &self,
        seq: SequenceNumber,
        key: &[u8],
        delta: &[u8],
        callback: F,
    ) -> Result<bool>
    where
        F: FnOnce(&[u8], &[u8]) -> UpdateStatus,
    {
        let Some(entry) = self.newest_entry(key, seq) else {
            return Ok(false);
        };
        let parsed = ParsedInternalKey::parse(entry.key().internal_key())?;
        if parsed.value_type != ValueType::Value {
            return Ok(false);
        }

        let guard = self.inplace_update_support.then(|| self.stripe(key).write());
        // SAFETY: we hold the stripe write lock, or in-place updates are
        // disabled and the slot is never written.
        let existing = decode_length_prefixed(unsafe { entry.value().bytes() })?.to_vec();
        match callback(&existing, delta) {
            UpdateStatus::Failed => Ok(true),
            UpdateStatus::UpdatedInPlace(new_value) => {
                if guard.is_some() {
                    // SAFETY: stripe write lock held via `guard`.
                    let slot = unsafe { entry.value().bytes_mut() };
                    if try_overwrite(slot, &new_value)? {
                        return Ok(true);
                    }
                }
                drop(guard);
                self.add(seq, ValueType::Value, key, &new_value, false)?;
                Ok(true)
            }
            UpdateStatus::Updated(new_value) => {
                drop(guard);
                self.add(seq, ValueType::Value, key, &new_value, false)?;
                Ok(true)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Flush Decision
    // -------------------------------------------------------------------------

    /// Whether this memtable should be switched out now.
    ///
    /// Keeps allocating while one more arena block still fits within the
    /// write buffer plus the over-allocation margin, flushes once memory is
    /// past that margin, and in between lets the last block fill to 75%.
    pub fn should_flush_now(&self) -> bool {
        let write_buffer_size = self.write_buffer_size.load(Ordering::Relaxed);
        let allocated = self.approximate_table_usage() + self.arena.memory_allocated_bytes();
        self.approximate_memory_usage.store(allocated, Ordering::Relaxed);

        let block = self.arena.block_size();
        let margin = (block as f64 * ALLOW_OVER_ALLOCATION_RATIO) as usize;
        if allocated + block < write_buffer_size + margin {
            return false;
        }
        if allocated > write_buffer_size + margin {
            return true;
        }
        self.arena.allocated_and_unused() < block / 4
    }

    fn update_flush_state(&self) {
        if self.flush_state.load(Ordering::Relaxed) == FlushState::NotRequested as u8
            && self.should_flush_now()
            && self
                .flush_state
                .compare_exchange(
                    FlushState::NotRequested as u8,
                    FlushState::Requested as u8,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            tracing::debug!(
                memtable = self.id,
                memory = self.approximate_memory_usage.load(Ordering::Relaxed),
                entries = self.num_entries(),
                "memtable flush requested"
            );
        }
    }

    pub fn flush_state(&self) -> FlushState {
        FlushState::from_u8(self.flush_state.load(Ordering::Relaxed))
    }

    /// Flush was requested and nobody has scheduled it yet
    pub fn should_schedule_flush(&self) -> bool {
        self.flush_state() == FlushState::Requested
    }

    /// Claim the pending flush; only one caller wins
    pub fn mark_flush_scheduled(&self) -> bool {
        self.flush_state
            .compare_exchange(
                FlushState::Requested as u8,
                FlushState::Scheduled as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Stop accepting writes
    pub fn mark_immutable(&self) {
        self.immutable.store(true, Ordering::Release);
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable.load(Ordering::Acquire)
    }

    pub fn set_write_buffer_size(&self, size: usize) {
        self.write_buffer_size.store(size, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Iteration
    // -------------------------------------------------------------------------

    pub fn iter(&self) -> MemTableIterator<'_, C> {
        MemTableIterator::new(self, &self.table)
    }

    /// Cursor over range tombstones: key is the start internal key, value is
    /// the exclusive end user key
    pub fn range_tombstone_iter(&self) -> RangeTombstoneIterator<'_, C> {
        MemTableIterator::new(self, &self.range_del_table)
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    /// Counts point entries and range tombstones alike
    pub fn is_empty(&self) -> bool {
        self.num_entries.load(Ordering::Relaxed) == 0
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn num_deletes(&self) -> u64 {
        self.num_deletes.load(Ordering::Relaxed)
    }

    pub fn num_range_deletes(&self) -> u64 {
        self.num_range_deletes.load(Ordering::Relaxed)
    }

    /// Encoded bytes written, excluding allocator slack
    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Relaxed)
    }

    /// Smallest sequence inserted; 0 while empty
    pub fn first_sequence(&self) -> SequenceNumber {
        match self.first_seqno.load(Ordering::Relaxed) {
            UNSET_SEQUENCE => 0,
            seq => seq,
        }
    }

    pub fn earliest_sequence(&self) -> SequenceNumber {
        self.earliest_seqno.load(Ordering::Relaxed)
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_table_usage() + self.arena.memory_allocated_bytes()
    }

    fn approximate_table_usage(&self) -> usize {
        (self.table.len() + self.range_del_table.len()) * SKIPLIST_ENTRY_OVERHEAD
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn pending_outcome(ctx: &GetContext) -> GetOutcome {
    if ctx.merge.is_empty() {
        GetOutcome::NotFound
    } else {
        GetOutcome::MergeInProgress
    }
}

fn strip_timestamp<C: Comparator>(key: &[u8]) -> &[u8] {
    &key[..key.len().saturating_sub(C::timestamp_size())]
}

/// Lower `cell` to `seq`, treating `unset` as larger than any sequence
fn cas_min(cell: &AtomicU64, seq: SequenceNumber, unset: u64) {
    let backoff = Backoff::new();
    let mut cur = cell.load(Ordering::Relaxed);
    while cur == unset || seq < cur {
        match cell.compare_exchange_weak(cur, seq, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => {
                cur = actual;
                backoff.spin();
            }
        }
    }
}

/// Rewrite `slot` as `varint32(len) | value` if it fits in the existing
/// allocation. The length prefix may shrink; trailing bytes are left as is.
fn try_overwrite(slot: &mut BytesMut, value: &[u8]) -> Result<bool> {
    let old_len = decode_length_prefixed(slot)?.len();
    if value.len() > old_len {
        return Ok(false);
    }
    let len = u32::try_from(value.len()).map_err(|_| KestrelError::invalid("value too large"))?;
    let n = crate::coding::encode_varint32(slot, len);
    slot[n..n + value.len()].copy_from_slice(value);
    Ok(true)
}
