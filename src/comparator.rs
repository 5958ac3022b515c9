//! Key comparators
//!
//! A comparator imposes the total order over user keys. Implementors are
//! zero-sized marker types: the order is fixed at compile time and carried
//! as a type parameter by the memtable, the merging iterator and the engine,
//! so comparisons never go through a vtable.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::key::{extract_trailer, extract_user_key};

/// Total order over encoded keys
pub trait Comparator: Send + Sync + 'static {
    /// Stable name, recorded alongside persisted data in a full engine
    fn name() -> &'static str;

    fn compare(a: &[u8], b: &[u8]) -> Ordering;

    /// Size of the timestamp suffix carried by every user key (0 = none)
    fn timestamp_size() -> usize {
        0
    }

    /// Compare with any timestamp suffix ignored
    fn compare_without_timestamp(a: &[u8], b: &[u8]) -> Ordering {
        Self::compare(a, b)
    }

    fn equal(a: &[u8], b: &[u8]) -> bool {
        Self::compare(a, b) == Ordering::Equal
    }
}

/// Lexicographic byte order
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name() -> &'static str {
        "kestrel.BytewiseComparator"
    }

    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Descending byte order
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseBytewiseComparator;

impl Comparator for ReverseBytewiseComparator {
    fn name() -> &'static str {
        "kestrel.ReverseBytewiseComparator"
    }

    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

/// Bytewise order over keys that end in an 8-byte little-endian timestamp.
///
/// Keys order by their prefix ascending, then by timestamp descending, so the
/// newest timestamp of a key comes first.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64TsComparator;

impl U64TsComparator {
    const TS: usize = 8;

    fn split(key: &[u8]) -> (&[u8], u64) {
        if key.len() < Self::TS {
            return (key, 0);
        }
        let (prefix, ts) = key.split_at(key.len() - Self::TS);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(ts);
        (prefix, u64::from_le_bytes(raw))
    }

    /// Append a timestamp suffix to `user_key`
    pub fn with_timestamp(user_key: &[u8], ts: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(user_key.len() + Self::TS);
        out.extend_from_slice(user_key);
        out.extend_from_slice(&ts.to_le_bytes());
        out
    }
}

impl Comparator for U64TsComparator {
    fn name() -> &'static str {
        "kestrel.BytewiseComparator.u64ts"
    }

    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        let (pa, ta) = Self::split(a);
        let (pb, tb) = Self::split(b);
        pa.cmp(pb).then_with(|| tb.cmp(&ta))
    }

    fn timestamp_size() -> usize {
        Self::TS
    }

    fn compare_without_timestamp(a: &[u8], b: &[u8]) -> Ordering {
        Self::split(a).0.cmp(Self::split(b).0)
    }
}

/// Orders internal keys: user key ascending by `C`, then `(seq, type)`
/// trailer descending.
pub struct InternalKeyComparator<C>(PhantomData<fn() -> C>);

impl<C: Comparator> Comparator for InternalKeyComparator<C> {
    fn name() -> &'static str {
        "kestrel.InternalKeyComparator"
    }

    fn compare(a: &[u8], b: &[u8]) -> Ordering {
        C::compare(extract_user_key(a), extract_user_key(b))
            .then_with(|| extract_trailer(b).cmp(&extract_trailer(a)))
    }
}
