//! Sorted cursors over a memtable's skiplists.
//!
//! Point cursors yield `(internal key, value)`; range tombstone cursors
//! yield `(start internal key, end user key)`. The current value is copied
//! out on every move so in-place updates cannot change it under the caller.

use std::cmp::Ordering as CmpOrdering;
use std::ops::Bound;

use crossbeam_skiplist::map::Entry;

use crate::comparator::{Comparator, InternalKeyComparator};
use crate::error::{KestrelError, Result};
use crate::iterator::InternalIterator;
use crate::key::ParsedInternalKey;

use super::table::{MemKey, MemTable, Table, ValueSlot};

pub struct MemTableIterator<'a, C: Comparator> {
    mem: &'a MemTable<C>,
    table: &'a Table<C>,
    current: Option<Entry<'a, MemKey<C>, ValueSlot>>,
    value: Vec<u8>,
    status: Option<KestrelError>,
}

/// Same cursor, over the range tombstone skiplist
pub type RangeTombstoneIterator<'a, C> = MemTableIterator<'a, C>;

impl<'a, C: Comparator> MemTableIterator<'a, C> {
    pub(crate) fn new(mem: &'a MemTable<C>, table: &'a Table<C>) -> Self {
        Self {
            mem,
            table,
            current: None,
            value: Vec::new(),
            status: None,
        }
    }

    /// Validate the entry under the cursor and copy its value out
    fn settle(&mut self) {
        let Some(entry) = &self.current else { return };
        let loaded: Result<Vec<u8>> = ParsedInternalKey::parse(entry.key().internal_key())
            .and_then(|p| self.mem.read_slot(p.user_key, entry.value()));
        match loaded {
            Ok(v) => self.value = v,
            Err(e) => {
                self.current = None;
                self.status.get_or_insert(e);
            }
        }
    }

    fn internal_cmp(entry: &Entry<'a, MemKey<C>, ValueSlot>, target: &[u8]) -> CmpOrdering {
        InternalKeyComparator::<C>::compare(entry.key().internal_key(), target)
    }
}

impl<'a, C: Comparator> InternalIterator for MemTableIterator<'a, C> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.current = self.table.front();
        self.settle();
    }

    fn seek_to_last(&mut self) {
        self.current = self.table.back();
        self.settle();
    }

    fn seek(&mut self, target: &[u8]) {
        let bound = MemKey::<C>::from_slice(target);
        let mut entry = self.table.lower_bound(Bound::Included(&bound));
        // the skiplist ignores the type byte; finish the job with the full order
        if let Some(e) = &entry {
            if Self::internal_cmp(e, target) == CmpOrdering::Less {
                entry = e.next();
            }
        }
        self.current = entry;
        self.settle();
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        let bound = MemKey::<C>::from_slice(target);
        let mut entry = self.table.upper_bound(Bound::Included(&bound));
        if let Some(e) = &entry {
            if Self::internal_cmp(e, target) == CmpOrdering::Greater {
                entry = e.prev();
            }
        }
        self.current = entry;
        self.settle();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.current = self.current.take().and_then(|e| e.next());
        self.settle();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.current = self.current.take().and_then(|e| e.prev());
        self.settle();
    }

    fn key(&self) -> &[u8] {
        match &self.current {
            Some(e) => e.key().internal_key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        &self.value
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
