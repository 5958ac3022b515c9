//! Lock Manager
//!
//! Per-key shared/exclusive locks for pessimistic transactions.
//!
//! ## Design
//! - Keys hash onto a fixed number of stripes per column family; each stripe
//!   owns a map of held locks plus a condvar that waiters sleep on.
//! - A sole holder may upgrade (or downgrade) its own lock in place.
//! - A lock whose expiration has passed can be taken over once every holder
//!   agrees to be stolen (see [`LockStealer`]).
//! - Optional deadlock detection walks the wait-for graph, bounded by a
//!   configurable depth; a walk that exceeds the bound is treated as a
//!   deadlock.
//! - Range locks are exclusive and conflict with overlapping ranges and with
//!   point locks held by other transactions inside the range.
//!
//! ## Lock Order
//! `ranges` → stripe mutex → `wait_for`. The stealer hook is called with a
//! stripe mutex held and must not call back into the lock manager.

use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{KestrelError, Result};

use super::tracker::LockTracker;
use super::write_batch::{BatchOp, ColumnFamilyId, WriteBatch};

/// Process-unique transaction identifier
pub type TransactionId = u64;

/// Upper bound on one sleep while waiting for a range to free up
const RANGE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Who is asking for a lock and on what terms
#[derive(Debug, Clone, Copy)]
pub struct LockRequest {
    pub txn_id: TransactionId,
    /// `Some(ZERO)` fails at once on conflict; `None` waits indefinitely
    pub timeout: Option<Duration>,
    pub deadlock_detect: bool,
    /// Point after which the requester's locks may be stolen
    pub expiration: Option<Instant>,
}

impl LockRequest {
    pub fn new(txn_id: TransactionId, timeout: Duration) -> Self {
        Self {
            txn_id,
            timeout: Some(timeout),
            deadlock_detect: false,
            expiration: None,
        }
    }
}

/// Decides whether the locks of an expired holder may be taken over
pub trait LockStealer: Send + Sync {
    /// Returns true once `holder` no longer owns its locks
    fn try_steal(&self, holder: TransactionId) -> bool;
}

/// Snapshot of one held point lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLockInfo {
    pub cf: ColumnFamilyId,
    pub key: Vec<u8>,
    pub holders: Vec<TransactionId>,
    pub exclusive: bool,
}

/// Locking service used by transactions and by plain batch writes
pub trait LockManager: Send + Sync {
    fn try_lock(&self, req: &LockRequest, cf: ColumnFamilyId, key: &[u8], exclusive: bool) -> Result<()>;

    /// Exclusive lock over `[start, end)`
    fn try_range_lock(&self, req: &LockRequest, cf: ColumnFamilyId, start: &[u8], end: &[u8]) -> Result<()>;

    /// Release `txn_id`'s hold on `key`; a no-op if it holds none
    fn unlock(&self, txn_id: TransactionId, cf: ColumnFamilyId, key: &[u8]);

    fn unlock_range(&self, txn_id: TransactionId, cf: ColumnFamilyId, start: &[u8], end: &[u8]);

    fn lock_status(&self) -> Vec<KeyLockInfo>;
}

// =============================================================================
// Point Lock Manager
// =============================================================================

#[derive(Debug)]
struct LockInfo {
    exclusive: bool,
    holders: Vec<TransactionId>,
    expiration: Option<Instant>,
}

struct Conflict {
    holders: Vec<TransactionId>,
    expiration: Option<Instant>,
}

#[derive(Default)]
struct LockStripe {
    keys: Mutex<HashMap<Vec<u8>, LockInfo>>,
    cv: Condvar,
}

struct LockMap {
    stripes: Box<[LockStripe]>,
}

impl LockMap {
    fn new(num_stripes: usize) -> Self {
        Self {
            stripes: (0..num_stripes.max(1)).map(|_| LockStripe::default()).collect(),
        }
    }

    fn stripe(&self, key: &[u8]) -> &LockStripe {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() % self.stripes.len() as u64) as usize]
    }
}

#[derive(Debug, Clone)]
struct RangeLock {
    cf: ColumnFamilyId,
    start: Vec<u8>,
    end: Vec<u8>,
    holder: TransactionId,
}

type KeyOrder = fn(&[u8], &[u8]) -> CmpOrdering;

fn bytewise(a: &[u8], b: &[u8]) -> CmpOrdering {
    a.cmp(b)
}

pub struct PointLockManager {
    num_stripes: usize,
    lock_maps: RwLock<HashMap<ColumnFamilyId, Arc<LockMap>>>,
    ranges: RwLock<Vec<RangeLock>>,
    range_waiters: Mutex<()>,
    range_cv: Condvar,
    /// Waiting transaction → the holders it waits on
    wait_for: Mutex<HashMap<TransactionId, Vec<TransactionId>>>,
    deadlock_detect_depth: usize,
    stealer: Option<Arc<dyn LockStealer>>,
    key_order: KeyOrder,
}

impl PointLockManager {
    pub fn new(num_stripes: usize, deadlock_detect_depth: usize) -> Self {
        Self {
            num_stripes: num_stripes.max(1),
            lock_maps: RwLock::new(HashMap::new()),
            ranges: RwLock::new(Vec::new()),
            range_waiters: Mutex::new(()),
            range_cv: Condvar::new(),
            wait_for: Mutex::new(HashMap::new()),
            deadlock_detect_depth: deadlock_detect_depth.max(1),
            stealer: None,
            key_order: bytewise,
        }
    }

    /// Consult `stealer` when a conflicting lock has expired
    pub fn with_stealer(mut self, stealer: Arc<dyn LockStealer>) -> Self {
        self.stealer = Some(stealer);
        self
    }

    /// Order used to decide whether a key falls inside a range lock
    pub fn with_key_order(mut self, order: KeyOrder) -> Self {
        self.key_order = order;
        self
    }

    fn lock_map(&self, cf: ColumnFamilyId) -> Arc<LockMap> {
        if let Some(map) = self.lock_maps.read().get(&cf) {
            return Arc::clone(map);
        }
        let mut maps = self.lock_maps.write();
        Arc::clone(
            maps.entry(cf)
                .or_insert_with(|| Arc::new(LockMap::new(self.num_stripes))),
        )
    }

    fn existing_lock_map(&self, cf: ColumnFamilyId) -> Option<Arc<LockMap>> {
        self.lock_maps.read().get(&cf).cloned()
    }

    fn in_range(&self, key: &[u8], start: &[u8], end: &[u8]) -> bool {
        (self.key_order)(start, key) != CmpOrdering::Greater
            && (self.key_order)(key, end) == CmpOrdering::Less
    }

    fn overlaps(&self, r: &RangeLock, start: &[u8], end: &[u8]) -> bool {
        (self.key_order)(&r.start, end) == CmpOrdering::Less
            && (self.key_order)(start, &r.end) == CmpOrdering::Less
    }

    /// Every holder of an expired lock agreed to be stolen
    fn is_expired(&self, info: &LockInfo) -> bool {
        match (info.expiration, &self.stealer) {
            (Some(deadline), Some(stealer)) if Instant::now() >= deadline => {
                info.holders.iter().all(|h| stealer.try_steal(*h))
            }
            _ => false,
        }
    }

    fn acquire_locked(
        &self,
        keys: &mut HashMap<Vec<u8>, LockInfo>,
        key: &[u8],
        req: &LockRequest,
        exclusive: bool,
    ) -> std::result::Result<(), Conflict> {
        let Some(info) = keys.get_mut(key) else {
            keys.insert(
                key.to_vec(),
                LockInfo {
                    exclusive,
                    holders: vec![req.txn_id],
                    expiration: req.expiration,
                },
            );
            return Ok(());
        };

        if !info.exclusive && !exclusive {
            if !info.holders.contains(&req.txn_id) {
                info.holders.push(req.txn_id);
            }
            // a holder without expiration keeps the lock unstealable
            info.expiration = match (info.expiration, req.expiration) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
            return Ok(());
        }

        if info.holders.len() == 1 && info.holders[0] == req.txn_id {
            info.exclusive = exclusive;
            info.expiration = req.expiration;
            return Ok(());
        }

        if self.is_expired(info) {
            tracing::debug!(
                txn = req.txn_id,
                previous = ?info.holders,
                "taking over expired lock"
            );
            info.holders.clear();
            info.holders.push(req.txn_id);
            info.exclusive = exclusive;
            info.expiration = req.expiration;
            return Ok(());
        }

        Err(Conflict {
            holders: info.holders.clone(),
            expiration: info.expiration,
        })
    }

    /// Record that `me` waits on `holders`; true if that closes a cycle
    fn register_wait(&self, me: TransactionId, holders: &[TransactionId]) -> bool {
        let mut wait_for = self.wait_for.lock();
        let waited_on = wait_for.values().any(|v| v.contains(&me));
        wait_for.insert(me, holders.to_vec());
        if !waited_on {
            return false;
        }

        let mut queue: VecDeque<TransactionId> = holders.iter().copied().collect();
        let mut visited = 0;
        while let Some(next) = queue.pop_front() {
            if next == me || visited >= self.deadlock_detect_depth {
                wait_for.remove(&me);
                return true;
            }
            visited += 1;
            if let Some(neighbours) = wait_for.get(&next) {
                queue.extend(neighbours.iter().copied());
            }
        }
        false
    }

    fn clear_wait(&self, me: TransactionId) {
        self.wait_for.lock().remove(&me);
    }

    fn conflicting_range(
        &self,
        ranges: &[RangeLock],
        cf: ColumnFamilyId,
        key: &[u8],
        me: TransactionId,
    ) -> Option<TransactionId> {
        ranges
            .iter()
            .find(|r| r.cf == cf && r.holder != me && self.in_range(key, &r.start, &r.end))
            .map(|r| r.holder)
    }

    fn point_conflict_in_range(&self, cf: ColumnFamilyId, start: &[u8], end: &[u8], me: TransactionId) -> bool {
        let Some(map) = self.existing_lock_map(cf) else {
            return false;
        };
        map.stripes.iter().any(|stripe| {
            stripe.keys.lock().iter().any(|(k, info)| {
                self.in_range(k, start, end) && info.holders.iter().any(|h| *h != me)
            })
        })
    }

    /// Sleep until a range lock may have been released; false once the
    /// deadline has passed
    fn wait_for_ranges(&self, deadline: Option<Instant>) -> bool {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            return false;
        }
        let poll = now + RANGE_POLL_INTERVAL;
        let until = deadline.map_or(poll, |d| d.min(poll));
        let mut guard = self.range_waiters.lock();
        self.range_cv.wait_until(&mut guard, until);
        true
    }
}

fn deadline_for(req: &LockRequest) -> Option<Instant> {
    req.timeout.and_then(|t| Instant::now().checked_add(t))
}

impl LockManager for PointLockManager {
    fn try_lock(&self, req: &LockRequest, cf: ColumnFamilyId, key: &[u8], exclusive: bool) -> Result<()> {
        let lock_map = self.lock_map(cf);
        let stripe = lock_map.stripe(key);
        let deadline = deadline_for(req);

        loop {
            let ranges = self.ranges.read();
            if let Some(holder) = self.conflicting_range(&ranges, cf, key, req.txn_id) {
                drop(ranges);
                if !self.wait_for_ranges(deadline) {
                    tracing::debug!(txn = req.txn_id, holder, "timed out waiting on range lock");
                    return Err(KestrelError::LockTimeout);
                }
                continue;
            }

            let mut keys = stripe.keys.lock();
            drop(ranges);
            let conflict = match self.acquire_locked(&mut keys, key, req, exclusive) {
                Ok(()) => return Ok(()),
                Err(c) => c,
            };

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                tracing::debug!(txn = req.txn_id, holders = ?conflict.holders, "lock wait timed out");
                return Err(KestrelError::LockTimeout);
            }
            if req.deadlock_detect && self.register_wait(req.txn_id, &conflict.holders) {
                tracing::warn!(txn = req.txn_id, holders = ?conflict.holders, "deadlock detected");
                return Err(KestrelError::Deadlock);
            }

            // wake up no later than the holder's expiration so it can be stolen
            let expiration = conflict.expiration.filter(|e| *e > now);
            let wake = match (deadline, expiration) {
                (Some(d), Some(e)) => Some(d.min(e)),
                (d, e) => d.or(e),
            };
            match wake {
                Some(at) => {
                    stripe.cv.wait_until(&mut keys, at);
                }
                None => stripe.cv.wait(&mut keys),
            }
            drop(keys);
            if req.deadlock_detect {
                self.clear_wait(req.txn_id);
            }
        }
    }

    fn try_range_lock(&self, req: &LockRequest, cf: ColumnFamilyId, start: &[u8], end: &[u8]) -> Result<()> {
        if (self.key_order)(start, end) != CmpOrdering::Less {
            return Err(KestrelError::invalid("range lock start must sort before its end"));
        }
        let deadline = deadline_for(req);
        loop {
            {
                let mut ranges = self.ranges.write();
                let conflict = ranges
                    .iter()
                    .any(|r| r.cf == cf && r.holder != req.txn_id && self.overlaps(r, start, end))
                    || self.point_conflict_in_range(cf, start, end, req.txn_id);
                if !conflict {
                    let held = ranges.iter().any(|r| {
                        r.cf == cf && r.holder == req.txn_id && r.start == start && r.end == end
                    });
                    if !held {
                        ranges.push(RangeLock {
                            cf,
                            start: start.to_vec(),
                            end: end.to_vec(),
                            holder: req.txn_id,
                        });
                    }
                    return Ok(());
                }
            }
            if !self.wait_for_ranges(deadline) {
                tracing::debug!(txn = req.txn_id, "range lock wait timed out");
                return Err(KestrelError::LockTimeout);
            }
        }
    }

    fn unlock(&self, txn_id: TransactionId, cf: ColumnFamilyId, key: &[u8]) {
        let Some(lock_map) = self.existing_lock_map(cf) else {
            return;
        };
        let stripe = lock_map.stripe(key);
        let mut keys = stripe.keys.lock();
        let Some(info) = keys.get_mut(key) else {
            return;
        };
        let Some(pos) = info.holders.iter().position(|h| *h == txn_id) else {
            return;
        };
        info.holders.swap_remove(pos);
        if info.holders.is_empty() {
            keys.remove(key);
        }
        drop(keys);
        stripe.cv.notify_all();
        self.range_cv.notify_all();
    }

    fn unlock_range(&self, txn_id: TransactionId, cf: ColumnFamilyId, start: &[u8], end: &[u8]) {
        self.ranges
            .write()
            .retain(|r| !(r.cf == cf && r.holder == txn_id && r.start == start && r.end == end));
        self.range_cv.notify_all();
    }

    fn lock_status(&self) -> Vec<KeyLockInfo> {
        let maps = self.lock_maps.read();
        let mut out = Vec::new();
        for (cf, map) in maps.iter() {
            for stripe in map.stripes.iter() {
                for (key, info) in stripe.keys.lock().iter() {
                    out.push(KeyLockInfo {
                        cf: *cf,
                        key: key.clone(),
                        holders: info.holders.clone(),
                        exclusive: info.exclusive,
                    });
                }
            }
        }
        out
    }
}

// =============================================================================
// Batch Locking
// =============================================================================

/// Locks taken on behalf of one write batch
#[derive(Debug, Default)]
pub struct LockedBatch {
    txn_id: TransactionId,
    keys: Vec<(ColumnFamilyId, Vec<u8>)>,
    ranges: Vec<(ColumnFamilyId, Vec<u8>, Vec<u8>)>,
}

impl LockedBatch {
    /// Take over every lock `tracker` records for `txn_id`, leaving them held
    pub(crate) fn from_tracker(txn_id: TransactionId, tracker: &LockTracker) -> Self {
        Self {
            txn_id,
            keys: tracker.keys().map(|(key, _)| key.clone()).collect(),
            ranges: tracker
                .ranges()
                .iter()
                .map(|r| (r.cf, r.start.clone(), r.end.clone()))
                .collect(),
        }
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn unlock(self, lm: &dyn LockManager) {
        for (cf, key) in &self.keys {
            lm.unlock(self.txn_id, *cf, key);
        }
        for (cf, start, end) in &self.ranges {
            lm.unlock_range(self.txn_id, *cf, start, end);
        }
    }
}

/// Exclusively lock every key `batch` writes.
///
/// Keys are taken grouped by column family and in bytewise order within one,
/// so two batches never deadlock on each other. Range deletions take range
/// locks after all point keys. On failure nothing stays locked.
pub fn lock_batch(lm: &dyn LockManager, req: &LockRequest, batch: &WriteBatch) -> Result<LockedBatch> {
    let mut keys: BTreeMap<ColumnFamilyId, BTreeSet<&[u8]>> = BTreeMap::new();
    let mut ranges: BTreeSet<(ColumnFamilyId, &[u8], &[u8])> = BTreeSet::new();
    for op in batch.ops() {
        match op {
            BatchOp::DeleteRange { cf, begin, end } => {
                ranges.insert((*cf, begin.as_slice(), end.as_slice()));
            }
            other => {
                keys.entry(other.column_family()).or_default().insert(other.key());
            }
        }
    }

    let mut locked = LockedBatch {
        txn_id: req.txn_id,
        ..LockedBatch::default()
    };
    for (cf, cf_keys) in keys {
        for key in cf_keys {
            if let Err(e) = lm.try_lock(req, cf, key, true) {
                locked.unlock(lm);
                return Err(e);
            }
            locked.keys.push((cf, key.to_vec()));
        }
    }
    for (cf, start, end) in ranges {
        if let Err(e) = lm.try_range_lock(req, cf, start, end) {
            locked.unlock(lm);
            return Err(e);
        }
        locked.ranges.push((cf, start.to_vec(), end.to_vec()));
    }
    Ok(locked)
}
