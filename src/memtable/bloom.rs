//! Membership filter for memtable point reads.
//!
//! No false negatives: once a key is added, `may_contain` never returns
//! false for it. False positives are allowed.
//!
//! The bit budget is split across independent shards picked by key hash, each
//! behind its own lock, so concurrent writers only contend when their keys
//! land in the same shard.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bloomfilter::Bloom;
use crossbeam::utils::CachePadded;
use parking_lot::RwLock;

use crate::error::{KestrelError, Result};

/// Bits budgeted per expected key
const BITS_PER_KEY: usize = 10;

const MAX_SHARDS: usize = 16;

/// Smallest shard worth splitting off, in bytes
const MIN_SHARD_BYTES: usize = 64;

pub struct MemTableBloom {
    shards: Box<[CachePadded<RwLock<Bloom<[u8]>>>]>,
}

impl MemTableBloom {
    /// Filter of roughly `total_bits` bits
    pub fn new(total_bits: usize) -> Result<Self> {
        let bytes = total_bits.div_ceil(8).max(8);
        let num_shards = (bytes / MIN_SHARD_BYTES).clamp(1, MAX_SHARDS);
        let shard_bytes = (bytes / num_shards).max(8);
        let expected = (shard_bytes * 8 / BITS_PER_KEY).max(1);

        let shards = (0..num_shards)
            .map(|_| {
                Bloom::new(shard_bytes, expected)
                    .map(|b| CachePadded::new(RwLock::new(b)))
                    .map_err(|e| {
                        KestrelError::invalid(format!("cannot size memtable bloom filter: {}", e))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            shards: shards.into_boxed_slice(),
        })
    }

    fn shard(&self, key: &[u8]) -> &RwLock<Bloom<[u8]>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    pub fn add(&self, key: &[u8]) {
        self.shard(key).write().set(key);
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.shard(key).read().check(key)
    }

    pub fn may_contain_batch(&self, keys: &[&[u8]]) -> Vec<bool> {
        keys.iter().map(|k| self.may_contain(k)).collect()
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}
