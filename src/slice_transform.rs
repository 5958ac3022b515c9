//! Key prefix extractors, used to build prefix membership filters.

/// Maps a key to the prefix it is filtered under
pub trait SliceTransform: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `key` has a prefix under this transform at all
    fn in_domain(&self, key: &[u8]) -> bool;

    /// Prefix of `key`; only called when `in_domain(key)` holds
    fn transform<'a>(&self, key: &'a [u8]) -> &'a [u8];
}

/// First `len` bytes of the key; shorter keys are outside the domain
#[derive(Debug, Clone, Copy)]
pub struct FixedPrefixTransform {
    len: usize,
}

impl FixedPrefixTransform {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl SliceTransform for FixedPrefixTransform {
    fn name(&self) -> &str {
        "kestrel.FixedPrefix"
    }

    fn in_domain(&self, key: &[u8]) -> bool {
        key.len() >= self.len
    }

    fn transform<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        &key[..self.len]
    }
}
