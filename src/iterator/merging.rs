//! Merging Iterator
//!
//! Presents N sorted children as one sorted cursor.
//!
//! ## Design
//! - Forward traversal keeps a min-heap of children keyed by their current key;
//!   reverse traversal keeps a max-heap, built on first backward use only.
//! - The heap top is the current record. Stepping moves only that child and
//!   sifts it back in place, which is cheap because the same child tends to
//!   stay on top for long runs.
//! - Equal keys from different children all surface; their relative order is
//!   whatever the heap yields.
//! - A child that reports an error is dropped. The first error seen is kept for
//!   the iterator's lifetime and later ones are discarded, so a failing child
//!   truncates the merge instead of aborting it.
//!
//! Not safe for concurrent use; independent instances over shared read-only
//! sources are fine.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::error::{KestrelError, Result};

use super::heap::IndexHeap;
use super::{EmptyIterator, InternalIterator};

/// Child cursor with its validity and key cached, so heap comparisons never
/// dispatch through the trait object.
struct IteratorWrapper<'a> {
    iter: Box<dyn InternalIterator + 'a>,
    valid: bool,
    key: Vec<u8>,
}

impl<'a> IteratorWrapper<'a> {
    fn new(iter: Box<dyn InternalIterator + 'a>) -> Self {
        let mut w = Self {
            iter,
            valid: false,
            key: Vec::new(),
        };
        w.update();
        w
    }

    fn update(&mut self) {
        self.valid = self.iter.valid();
        if self.valid {
            self.key.clear();
            self.key.extend_from_slice(self.iter.key());
        }
    }

    fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
        self.update();
    }

    fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
        self.update();
    }

    fn seek(&mut self, target: &[u8]) {
        self.iter.seek(target);
        self.update();
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        self.iter.seek_for_prev(target);
        self.update();
    }

    fn next(&mut self) {
        self.iter.next();
        self.update();
    }

    fn prev(&mut self) {
        self.iter.prev();
        self.update();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Sorted union of child cursors, ordered by `C`
pub struct MergingIterator<'a, C: Comparator = BytewiseComparator> {
    children: Vec<IteratorWrapper<'a>>,
    /// Index of the child positioned at the current record
    current: Option<usize>,
    direction: Direction,
    min_heap: IndexHeap,
    /// Built on the first backward move
    max_heap: Option<IndexHeap>,
    /// First error observed on any child
    status: Option<KestrelError>,
    _cmp: PhantomData<fn() -> C>,
}

impl<'a, C: Comparator> MergingIterator<'a, C> {
    pub fn new(children: Vec<Box<dyn InternalIterator + 'a>>) -> Self {
        let n = children.len();
        let mut iter = Self {
            children: children.into_iter().map(IteratorWrapper::new).collect(),
            current: None,
            direction: Direction::Forward,
            min_heap: IndexHeap::with_capacity(n),
            max_heap: None,
            status: None,
            _cmp: PhantomData,
        };
        for i in 0..n {
            iter.add_to_min_heap_or_check_status(i);
        }
        iter.current = iter.min_heap.top();
        iter
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    fn consider_status(&mut self, s: Result<()>) {
        if let Err(e) = s {
            if self.status.is_none() {
                tracing::debug!(error = %e, "merging iterator dropping failed child");
                self.status = Some(e);
            }
        }
    }

    fn clear_heaps(&mut self) {
        self.min_heap.clear();
        if let Some(h) = self.max_heap.as_mut() {
            h.clear();
        }
    }

    fn init_max_heap(&mut self) {
        if self.max_heap.is_none() {
            self.max_heap = Some(IndexHeap::with_capacity(self.children.len()));
        }
    }

    fn add_to_min_heap_or_check_status(&mut self, i: usize) {
        if self.children[i].valid {
            let children = &self.children;
            self.min_heap.push(i, |a, b| {
                C::compare(&children[a].key, &children[b].key) == Ordering::Less
            });
        } else {
            let s = self.children[i].iter.status();
            self.consider_status(s);
        }
    }

    fn add_to_max_heap_or_check_status(&mut self, i: usize) {
        if self.children[i].valid {
            let children = &self.children;
            if let Some(heap) = self.max_heap.as_mut() {
                heap.push(i, |a, b| {
                    C::compare(&children[a].key, &children[b].key) == Ordering::Greater
                });
            }
        } else {
            let s = self.children[i].iter.status();
            self.consider_status(s);
        }
    }

    fn current_forward(&self) -> Option<usize> {
        self.min_heap.top()
    }

    fn current_reverse(&self) -> Option<usize> {
        self.max_heap.as_ref().and_then(IndexHeap::top)
    }

    /// Reposition every non-current child strictly after the current key,
    /// then rebuild the min-heap. A child may repeat a key, so every copy of
    /// the current key is stepped over.
    fn switch_to_forward(&mut self) {
        let Some(cur) = self.current else { return };
        self.clear_heaps();
        let target = self.children[cur].key.clone();
        for i in 0..self.children.len() {
            if i != cur {
                let child = &mut self.children[i];
                child.seek(&target);
                while child.valid && C::equal(&target, &child.key) {
                    child.next();
                }
            }
            self.add_to_min_heap_or_check_status(i);
        }
        self.direction = Direction::Forward;
    }

    /// Reposition every non-current child strictly before the current key,
    /// then rebuild the max-heap
    fn switch_to_backward(&mut self) {
        let Some(cur) = self.current else { return };
        self.clear_heaps();
        self.init_max_heap();
        let target = self.children[cur].key.clone();
        for i in 0..self.children.len() {
            if i != cur {
                let child = &mut self.children[i];
                child.seek_for_prev(&target);
                while child.valid && C::equal(&target, &child.key) {
                    child.prev();
                }
            }
            self.add_to_max_heap_or_check_status(i);
        }
        self.direction = Direction::Reverse;
    }
}

impl<'a, C: Comparator> InternalIterator for MergingIterator<'a, C> {
    fn valid(&self) -> bool {
        self.current.is_some() && self.status.is_none()
    }

    fn seek_to_first(&mut self) {
        self.clear_heaps();
        for i in 0..self.children.len() {
            self.children[i].seek_to_first();
            self.add_to_min_heap_or_check_status(i);
        }
        self.direction = Direction::Forward;
        self.current = self.current_forward();
    }

    fn seek_to_last(&mut self) {
        self.clear_heaps();
        self.init_max_heap();
        for i in 0..self.children.len() {
            self.children[i].seek_to_last();
            self.add_to_max_heap_or_check_status(i);
        }
        self.direction = Direction::Reverse;
        self.current = self.current_reverse();
    }

    fn seek(&mut self, target: &[u8]) {
        self.clear_heaps();
        for i in 0..self.children.len() {
            self.children[i].seek(target);
            self.add_to_min_heap_or_check_status(i);
        }
        self.direction = Direction::Forward;
        self.current = self.current_forward();
    }

    fn seek_for_prev(&mut self, target: &[u8]) {
        self.clear_heaps();
        self.init_max_heap();
        for i in 0..self.children.len() {
            self.children[i].seek_for_prev(target);
            self.add_to_max_heap_or_check_status(i);
        }
        self.direction = Direction::Reverse;
        self.current = self.current_reverse();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if self.direction != Direction::Forward {
            self.switch_to_forward();
        }
        let Some(cur) = self.current else { return };
        // `cur` is the min-heap top here: every other child is strictly past it.
        self.children[cur].next();
        if self.children[cur].valid {
            let children = &self.children;
            self.min_heap.update_top(|a, b| {
                C::compare(&children[a].key, &children[b].key) == Ordering::Less
            });
        } else {
            let s = self.children[cur].iter.status();
            self.consider_status(s);
            let children = &self.children;
            self.min_heap.pop(|a, b| {
                C::compare(&children[a].key, &children[b].key) == Ordering::Less
            });
        }
        self.current = self.current_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if self.direction != Direction::Reverse {
            self.switch_to_backward();
        }
        let Some(cur) = self.current else { return };
        self.children[cur].prev();
        let still_valid = self.children[cur].valid;
        if !still_valid {
            let s = self.children[cur].iter.status();
            self.consider_status(s);
        }
        let children = &self.children;
        if let Some(heap) = self.max_heap.as_mut() {
            let before =
                |a: usize, b: usize| C::compare(&children[a].key, &children[b].key) == Ordering::Greater;
            if still_valid {
                heap.update_top(before);
            } else {
                heap.pop(before);
            }
        }
        self.current = self.current_reverse();
    }

    fn key(&self) -> &[u8] {
        match self.current {
            Some(i) => &self.children[i].key,
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match self.current {
            Some(i) => self.children[i].iter.value(),
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Build the cheapest cursor over `children`: an empty cursor for none, the
/// child itself for one, a merging cursor otherwise.
pub fn new_merging_iterator<'a, C: Comparator>(
    mut children: Vec<Box<dyn InternalIterator + 'a>>,
) -> Box<dyn InternalIterator + 'a> {
    match children.len() {
        0 => Box::new(EmptyIterator::new()),
        1 => children.pop().unwrap_or_else(|| Box::new(EmptyIterator::new())),
        _ => Box::new(MergingIterator::<'a, C>::new(children)),
    }
}
