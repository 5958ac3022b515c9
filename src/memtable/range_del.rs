//! Fragmented view of a memtable's range tombstones.
//!
//! Overlapping `[start, end)` tombstones are cut at every boundary into
//! disjoint fragments, each carrying the sequences of the tombstones that
//! span it, newest first. A covering lookup is then two binary searches.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::comparator::Comparator;
use crate::key::SequenceNumber;

struct Fragment {
    start: Vec<u8>,
    end: Vec<u8>,
    /// Descending
    seqs: Vec<SequenceNumber>,
}

pub(crate) struct FragmentedTombstones<C> {
    fragments: Vec<Fragment>,
    /// Tombstone count of the memtable when this view was built
    version: u64,
    _cmp: PhantomData<fn() -> C>,
}

impl<C: Comparator> FragmentedTombstones<C> {
    /// Fragment `(start, end, seq)` tombstones. Empty ranges are ignored.
    pub(crate) fn build(
        tombstones: Vec<(Vec<u8>, Vec<u8>, SequenceNumber)>,
        version: u64,
    ) -> Self {
        let mut tombstones: Vec<_> = tombstones
            .into_iter()
            .filter(|(start, end, _)| C::compare(start, end) == Ordering::Less)
            .collect();
        tombstones.sort_by(|a, b| C::compare(&a.0, &b.0));

        let mut bounds: Vec<&[u8]> = tombstones
            .iter()
            .flat_map(|(start, end, _)| [start.as_slice(), end.as_slice()])
            .collect();
        bounds.sort_by(|a, b| C::compare(a, b));
        bounds.dedup_by(|a, b| C::equal(a, b));

        let mut fragments = Vec::new();
        let mut active: Vec<(&[u8], SequenceNumber)> = Vec::new();
        let mut next = 0;
        for pair in bounds.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            while next < tombstones.len() && C::compare(&tombstones[next].0, lo) != Ordering::Greater {
                active.push((tombstones[next].1.as_slice(), tombstones[next].2));
                next += 1;
            }
            active.retain(|(end, _)| C::compare(end, lo) == Ordering::Greater);
            if active.is_empty() {
                continue;
            }
            let mut seqs: Vec<_> = active.iter().map(|(_, seq)| *seq).collect();
            seqs.sort_unstable_by(|a, b| b.cmp(a));
            seqs.dedup();
            fragments.push(Fragment {
                start: lo.to_vec(),
                end: hi.to_vec(),
                seqs,
            });
        }

        Self {
            fragments,
            version,
            _cmp: PhantomData,
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn num_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// Newest sequence at or below `snapshot` among tombstones covering
    /// `user_key`; 0 when none do
    pub(crate) fn max_covering_seq(&self, user_key: &[u8], snapshot: SequenceNumber) -> SequenceNumber {
        let idx = self
            .fragments
            .partition_point(|f| C::compare(&f.start, user_key) != Ordering::Greater);
        let Some(fragment) = idx.checked_sub(1).map(|i| &self.fragments[i]) else {
            return 0;
        };
        if C::compare(user_key, &fragment.end) != Ordering::Less {
            return 0;
        }
        let visible = fragment.seqs.partition_point(|seq| *seq > snapshot);
        fragment.seqs.get(visible).copied().unwrap_or(0)
    }
}
