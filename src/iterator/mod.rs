//! Iterator Module
//!
//! Sorted cursors over encoded records.
//!
//! ## Responsibilities
//! - Define the cursor capability set shared by every sorted source
//! - Merge N sorted cursors into one, forward and backward
//! - Provide trivial sources (empty / error / in-memory vector)
//!
//! ## Cursor Contract
//! ```text
//!   seek_*  ──▶ valid()? ──yes──▶ key()/value() ──▶ next()/prev() ─┐
//!                 │                                               │
//!                 no ──▶ status()  (clean end, or an error)  ◀────┘
//! ```
//! `key()` and `value()` may only be called while `valid()` holds. A cursor
//! that is not valid must still be status-checked.

mod heap;
mod merging;

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::error::{KestrelError, Result};

pub use merging::{new_merging_iterator, MergingIterator};

/// The capability set every sorted source exposes
pub trait InternalIterator {
    fn valid(&self) -> bool;

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Position at the first record with key >= `target`
    fn seek(&mut self, target: &[u8]);

    /// Position at the last record with key <= `target`
    fn seek_for_prev(&mut self, target: &[u8]);

    fn next(&mut self);

    fn prev(&mut self);

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    fn status(&self) -> Result<()>;
}

impl<I: InternalIterator + ?Sized> InternalIterator for &mut I {
    fn valid(&self) -> bool {
        (**self).valid()
    }
    fn seek_to_first(&mut self) {
        (**self).seek_to_first()
    }
    fn seek_to_last(&mut self) {
        (**self).seek_to_last()
    }
    fn seek(&mut self, target: &[u8]) {
        (**self).seek(target)
    }
    fn seek_for_prev(&mut self, target: &[u8]) {
        (**self).seek_for_prev(target)
    }
    fn next(&mut self) {
        (**self).next()
    }
    fn prev(&mut self) {
        (**self).prev()
    }
    fn key(&self) -> &[u8] {
        (**self).key()
    }
    fn value(&self) -> &[u8] {
        (**self).value()
    }
    fn status(&self) -> Result<()> {
        (**self).status()
    }
}

impl<I: InternalIterator + ?Sized> InternalIterator for Box<I> {
    fn valid(&self) -> bool {
        (**self).valid()
    }
    fn seek_to_first(&mut self) {
        (**self).seek_to_first()
    }
    fn seek_to_last(&mut self) {
        (**self).seek_to_last()
    }
    fn seek(&mut self, target: &[u8]) {
        (**self).seek(target)
    }
    fn seek_for_prev(&mut self, target: &[u8]) {
        (**self).seek_for_prev(target)
    }
    fn next(&mut self) {
        (**self).next()
    }
    fn prev(&mut self) {
        (**self).prev()
    }
    fn key(&self) -> &[u8] {
        (**self).key()
    }
    fn value(&self) -> &[u8] {
        (**self).value()
    }
    fn status(&self) -> Result<()> {
        (**self).status()
    }
}

// =============================================================================
// Empty / Error Iterator
// =============================================================================

/// A source with no records, optionally reporting an error
#[derive(Debug, Default)]
pub struct EmptyIterator {
    status: Option<KestrelError>,
}

impl EmptyIterator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An iterator whose only content is `err`
    pub fn with_error(err: KestrelError) -> Self {
        Self { status: Some(err) }
    }
}

impl InternalIterator for EmptyIterator {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn seek_for_prev(&mut self, _target: &[u8]) {}
    fn next(&mut self) {
        debug_assert!(false, "next() on empty iterator");
    }
    fn prev(&mut self) {
        debug_assert!(false, "prev() on empty iterator");
    }
    fn key(&self) -> &[u8] {
        &[]
    }
    fn value(&self) -> &[u8] {
        &[]
    }
    fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Vector Iterator
// =============================================================================

/// In-memory sorted source, ordered by `C`
pub struct VecIterator<C: Comparator = BytewiseComparator> {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: Option<usize>,
    _cmp: PhantomData<fn() -> C>,
}

impl<C: Comparator> VecIterator<C> {
    /// Build from unsorted entries; they are sorted by `C`
    pub fn new(mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        entries.sort_by(|a, b| C::compare(&a.0, &b.0));
        Self {
            entries,
            pos: None,
            _cmp: PhantomData,
        }
    }

    /// Build from keys only, with empty values
    pub fn from_keys<K: AsRef<[u8]>>(keys: impl IntoIterator<Item = K>) -> Self {
        Self::new(
            keys.into_iter()
                .map(|k| (k.as_ref().to_vec(), Vec::new()))
                .collect(),
        )
    }

    fn lower_bound(&self, target: &[u8]) -> usize {
        self.entries
            .partition_point(|(k, _)| C::compare(k, target) == Ordering::Less)
    }
}

impl<C: Comparator> InternalIterator for VecIterator<C> {
    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn seek_to_first(&mut self) {
        self.pos = if self.entries.is_empty() { None } else { Some(0) };
    }

    fn seek_to_last(&mut self) {
        self.pos = self.entries.len().checked_sub(1);
    }

    fn seek(&mut self, target: &[u8]) {
        let idx = self.lower_bound(target);
        self.pos = (idx < self.entries.len()).then_some(idx);
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        let idx = self
            .entries
            .partition_point(|(k, _)| C::compare(k, target) != Ordering::Greater);
        self.pos = idx.checked_sub(1);
    }

    fn next(&mut self) {
        self.pos = self
            .pos
            .map(|p| p + 1)
            .filter(|&p| p < self.entries.len());
    }

    fn prev(&mut self) {
        self.pos = self.pos.and_then(|p| p.checked_sub(1));
    }

    fn key(&self) -> &[u8] {
        self.pos.map(|p| self.entries[p].0.as_slice()).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.pos.map(|p| self.entries[p].1.as_slice()).unwrap_or(&[])
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
