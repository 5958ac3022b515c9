//! Property tests for merging iterator ordering

use proptest::prelude::*;

use kestrelkv::iterator::{InternalIterator, MergingIterator, VecIterator};
use kestrelkv::BytewiseComparator;

fn children_strategy() -> impl Strategy<Value = Vec<Vec<Vec<u8>>>> {
    prop::collection::vec(
        prop::collection::vec(prop::collection::vec(0u8..6, 1..3), 0..12),
        0..6,
    )
}

/// Keys dealt out to children, each key owned by one child that may repeat
/// it up to three times
fn owned_children_strategy() -> impl Strategy<Value = Vec<Vec<Vec<u8>>>> {
    (
        prop::collection::btree_map(prop::collection::vec(any::<u8>(), 1..4), 1usize..4, 0..40),
        1usize..6,
        any::<u64>(),
    )
        .prop_map(|(keys, n, seed)| {
            let mut children = vec![Vec::new(); n];
            for (i, (key, repeats)) in keys.into_iter().enumerate() {
                let slot = (seed.rotate_left(i as u32 % 64) as usize ^ i) % n;
                for _ in 0..repeats {
                    children[slot].push(key.clone());
                }
            }
            children
        })
}

fn build(children: &[Vec<Vec<u8>>]) -> MergingIterator<'static, BytewiseComparator> {
    MergingIterator::new(
        children
            .iter()
            .map(|keys| {
                Box::new(VecIterator::<BytewiseComparator>::from_keys(keys.iter()))
                    as Box<dyn InternalIterator>
            })
            .collect(),
    )
}

proptest! {
    /// Forward scan is the sorted multiset union; backward is its reverse
    #[test]
    fn prop_scans_yield_sorted_union(children in children_strategy()) {
        let mut expected: Vec<Vec<u8>> = children.iter().flatten().cloned().collect();
        expected.sort();

        let mut it = build(&children);
        let mut forward = Vec::new();
        it.seek_to_first();
        while it.valid() {
            forward.push(it.key().to_vec());
            it.next();
        }
        prop_assert_eq!(&forward, &expected);

        let mut backward = Vec::new();
        it.seek_to_last();
        while it.valid() {
            backward.push(it.key().to_vec());
            it.prev();
        }
        backward.reverse();
        prop_assert_eq!(&backward, &expected);
        prop_assert!(it.status().is_ok());
    }

    /// Stepping back then forward returns to the same key
    #[test]
    fn prop_direction_switch_round_trips(
        children in owned_children_strategy(),
        steps in 1usize..20,
    ) {
        let mut it = build(&children);
        it.seek_to_first();
        for _ in 0..steps {
            if !it.valid() {
                break;
            }
            let here = it.key().to_vec();
            it.next();
            if !it.valid() {
                break;
            }
            it.prev();
            prop_assert!(it.valid());
            prop_assert_eq!(it.key(), here.as_slice());
            it.next();
        }
    }

    /// After a reverse seek, stepping forward yields every key past the
    /// landing key exactly once per copy
    #[test]
    fn prop_forward_after_seek_for_prev(
        children in children_strategy(),
        target in prop::collection::vec(0u8..6, 1..3),
    ) {
        let mut all: Vec<Vec<u8>> = children.iter().flatten().cloned().collect();
        all.sort();

        let mut it = build(&children);
        it.seek_for_prev(&target);
        if !it.valid() {
            prop_assert!(all.iter().all(|k| *k > target));
            return Ok(());
        }
        let landed = it.key().to_vec();
        prop_assert!(landed <= target);

        let mut rest = Vec::new();
        it.next();
        while it.valid() {
            rest.push(it.key().to_vec());
            it.next();
        }
        let expected: Vec<Vec<u8>> = all.into_iter().filter(|k| *k > landed).collect();
        prop_assert_eq!(rest, expected);
    }

    /// After a forward seek, stepping backward yields every key before the
    /// landing key
    #[test]
    fn prop_backward_after_seek(
        children in children_strategy(),
        target in prop::collection::vec(0u8..6, 1..3),
    ) {
        let mut all: Vec<Vec<u8>> = children.iter().flatten().cloned().collect();
        all.sort();

        let mut it = build(&children);
        it.seek(&target);
        if !it.valid() {
            prop_assert!(all.iter().all(|k| *k < target));
            return Ok(());
        }
        let landed = it.key().to_vec();
        prop_assert!(landed >= target);

        let mut rest = Vec::new();
        it.prev();
        while it.valid() {
            rest.push(it.key().to_vec());
            it.prev();
        }
        rest.reverse();
        let expected: Vec<Vec<u8>> = all.into_iter().filter(|k| *k < landed).collect();
        prop_assert_eq!(rest, expected);
    }
}
