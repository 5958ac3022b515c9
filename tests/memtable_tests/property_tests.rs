//! Property tests for memtable reads and entry encoding

use std::collections::BTreeMap;

use proptest::prelude::*;

use kestrelkv::key::{decode_entry, encode_entry, encoded_entry_len, LookupKey, MAX_SEQUENCE_NUMBER};
use kestrelkv::memtable::{GetContext, GetOutcome, MemTable};
use kestrelkv::{Config, ValueType};

fn arb_value_type() -> impl Strategy<Value = ValueType> {
    prop_oneof![
        Just(ValueType::Value),
        Just(ValueType::Deletion),
        Just(ValueType::SingleDeletion),
        Just(ValueType::Merge),
        Just(ValueType::RangeDeletion),
        Just(ValueType::BlobIndex),
    ]
}

proptest! {
    /// A read at `snapshot` returns the newest version at or below it
    #[test]
    fn prop_get_returns_newest_visible_version(
        writes in prop::collection::btree_map(
            (0u8..8, 0u64..200),
            (any::<bool>(), prop::collection::vec(any::<u8>(), 0..16)),
            1..64,
        ),
        snapshot in 0u64..220,
    ) {
        let mem: MemTable = MemTable::new(1, &Config::default(), MAX_SEQUENCE_NUMBER).unwrap();
        for ((key, seq), (is_put, value)) in &writes {
            let vt = if *is_put { ValueType::Value } else { ValueType::Deletion };
            mem.add(*seq, vt, &[*key], value, false).unwrap();
        }

        for key in 0u8..8 {
            let newest: Option<(&u64, &(bool, Vec<u8>))> = writes
                .iter()
                .filter(|((k, seq), _)| *k == key && *seq <= snapshot)
                .map(|((_, seq), v)| (seq, v))
                .max_by_key(|(seq, _)| **seq);
            let expected = match newest {
                None => GetOutcome::NotFound,
                Some((_, (true, value))) => GetOutcome::Found(value.clone()),
                Some((_, (false, _))) => GetOutcome::Deleted,
            };

            let mut ctx = GetContext::default();
            let got = mem
                .get(&LookupKey::new(&[key], snapshot), &mut ctx, None, None)
                .unwrap();
            prop_assert_eq!(got, expected);
        }
    }

    /// Every inserted key is found again; the filter never hides it
    #[test]
    fn prop_filter_has_no_false_negatives(
        keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 1..24), 1..128),
    ) {
        let config = Config::builder()
            .write_buffer_size(256 * 1024)
            .memtable_prefix_bloom_size_ratio(0.02)
            .memtable_whole_key_filtering(true)
            .build();
        let mem: MemTable = MemTable::new(1, &config, MAX_SEQUENCE_NUMBER).unwrap();
        let expected: BTreeMap<Vec<u8>, u64> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i as u64 + 1))
            .collect();
        for (key, seq) in &expected {
            mem.add(*seq, ValueType::Value, key, key, false).unwrap();
        }
        for key in expected.keys() {
            let mut ctx = GetContext::default();
            let got = mem
                .get(&LookupKey::new(key, MAX_SEQUENCE_NUMBER), &mut ctx, None, None)
                .unwrap();
            prop_assert_eq!(got, GetOutcome::Found(key.clone()));
        }
    }

    /// The covering tombstone is the newest visible one whose range holds the key
    #[test]
    fn prop_covering_tombstone_matches_scan(
        tombstones in prop::collection::btree_map(
            0u64..100,
            (0u8..16, 0u8..16),
            1..24,
        ),
        snapshot in 0u64..110,
    ) {
        let mem: MemTable = MemTable::new(1, &Config::default(), MAX_SEQUENCE_NUMBER).unwrap();
        for (seq, (start, end)) in &tombstones {
            mem.add(*seq, ValueType::RangeDeletion, &[*start], &[*end], false).unwrap();
        }

        for key in 0u8..17 {
            let expected = tombstones
                .iter()
                .filter(|(seq, (start, end))| *start <= key && key < *end && **seq <= snapshot)
                .map(|(seq, _)| *seq)
                .max()
                .unwrap_or(0);
            prop_assert_eq!(mem.max_covering_tombstone_seq(&[key], snapshot), expected);
        }
    }

    /// Encoding then decoding an entry reproduces its parts
    #[test]
    fn prop_entry_encoding_is_lossless(
        key in prop::collection::vec(any::<u8>(), 0..64),
        value in prop::collection::vec(any::<u8>(), 0..256),
        seq in 0u64..=MAX_SEQUENCE_NUMBER,
        vt in arb_value_type(),
    ) {
        let mut buf = vec![0u8; encoded_entry_len(&key, &value)];
        encode_entry(&mut buf, &key, seq, vt, &value).unwrap();
        let (parsed, decoded_value) = decode_entry(&buf).unwrap();
        prop_assert_eq!(parsed.user_key, key.as_slice());
        prop_assert_eq!(parsed.sequence, seq);
        prop_assert_eq!(parsed.value_type, vt);
        prop_assert_eq!(decoded_value, value.as_slice());
    }
}
