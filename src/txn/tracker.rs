//! Per-transaction record of held locks.
//!
//! A transaction keeps one tracker for everything it holds and one per save
//! point for the locks taken since that save point. Rolling back to a save
//! point subtracts the latter from the former; keys whose counts drop to
//! zero were only locked inside the rolled-back scope and can be released.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::key::SequenceNumber;

use super::write_batch::ColumnFamilyId;

/// What a transaction knows about one locked key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedKeyInfo {
    /// The key is known unmodified from this sequence onward
    pub seq: SequenceNumber,
    pub num_reads: u32,
    pub num_writes: u32,
    pub exclusive: bool,
}

impl TrackedKeyInfo {
    fn new(seq: SequenceNumber) -> Self {
        Self {
            seq,
            num_reads: 0,
            num_writes: 0,
            exclusive: false,
        }
    }
}

/// Range lock held by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedRange {
    pub cf: ColumnFamilyId,
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
pub struct LockTracker {
    keys: HashMap<(ColumnFamilyId, Vec<u8>), TrackedKeyInfo>,
    ranges: Vec<TrackedRange>,
}

impl LockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more access to `key`. A smaller `seq` replaces the tracked
    /// one since it is a stronger guarantee.
    pub fn track(
        &mut self,
        cf: ColumnFamilyId,
        key: &[u8],
        seq: SequenceNumber,
        read_only: bool,
        exclusive: bool,
    ) {
        let info = self
            .keys
            .entry((cf, key.to_vec()))
            .or_insert_with(|| TrackedKeyInfo::new(seq));
        if seq < info.seq {
            info.seq = seq;
        }
        if read_only {
            info.num_reads += 1;
        } else {
            info.num_writes += 1;
        }
        info.exclusive |= exclusive;
    }

    pub fn track_range(&mut self, cf: ColumnFamilyId, start: &[u8], end: &[u8]) {
        let range = TrackedRange {
            cf,
            start: start.to_vec(),
            end: end.to_vec(),
        };
        if !self.ranges.contains(&range) {
            self.ranges.push(range);
        }
    }

    pub fn get(&self, cf: ColumnFamilyId, key: &[u8]) -> Option<&TrackedKeyInfo> {
        self.keys.get(&(cf, key.to_vec()))
    }

    pub fn has_range(&self, cf: ColumnFamilyId, start: &[u8], end: &[u8]) -> bool {
        self.ranges
            .iter()
            .any(|r| r.cf == cf && r.start == start && r.end == end)
    }

    /// Fold `other` into this tracker, as if its accesses had happened here
    pub fn merge(&mut self, other: &LockTracker) {
        for ((cf, key), info) in &other.keys {
            match self.keys.entry((*cf, key.clone())) {
                Entry::Occupied(mut e) => {
                    let cur = e.get_mut();
                    cur.seq = cur.seq.min(info.seq);
                    cur.num_reads += info.num_reads;
                    cur.num_writes += info.num_writes;
                    cur.exclusive |= info.exclusive;
                }
                Entry::Vacant(e) => {
                    e.insert(*info);
                }
            }
        }
        for r in &other.ranges {
            self.track_range(r.cf, &r.start, &r.end);
        }
    }

    /// Remove `other`'s accesses from this tracker.
    ///
    /// Returns the keys and ranges no longer tracked at all.
    pub fn subtract(
        &mut self,
        other: &LockTracker,
    ) -> (Vec<(ColumnFamilyId, Vec<u8>)>, Vec<TrackedRange>) {
        let mut released = Vec::new();
        for (id, info) in &other.keys {
            if let Entry::Occupied(mut e) = self.keys.entry(id.clone()) {
                let cur = e.get_mut();
                cur.num_reads = cur.num_reads.saturating_sub(info.num_reads);
                cur.num_writes = cur.num_writes.saturating_sub(info.num_writes);
                if cur.num_reads == 0 && cur.num_writes == 0 {
                    e.remove();
                    released.push(id.clone());
                }
            }
        }
        let mut released_ranges = Vec::new();
        for r in &other.ranges {
            if let Some(pos) = self.ranges.iter().position(|x| x == r) {
                released_ranges.push(self.ranges.remove(pos));
            }
        }
        (released, released_ranges)
    }

    pub fn keys(&self) -> impl Iterator<Item = (&(ColumnFamilyId, Vec<u8>), &TrackedKeyInfo)> {
        self.keys.iter()
    }

    pub fn ranges(&self) -> &[TrackedRange] {
        &self.ranges
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.ranges.clear();
    }
}
