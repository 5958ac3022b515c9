//! Configuration for KestrelKV
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::key::SequenceNumber;
use crate::memtable::UpdateStatus;
use crate::merge_operator::MergeOperator;
use crate::slice_transform::SliceTransform;

/// Rewrites the current value of a key from a delta, for in-place updates.
/// Receives `None` when the key has no live value in the active memtable.
pub type InplaceCallback = Arc<dyn Fn(Option<&[u8]>, &[u8]) -> UpdateStatus + Send + Sync>;

/// Main configuration for a KestrelKV engine
#[derive(Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Budget for one memtable before it is switched out (in bytes)
    pub write_buffer_size: usize,

    /// Arena block size; 0 derives it from `write_buffer_size`
    pub arena_block_size: usize,

    /// Bloom filter bits as a fraction of `write_buffer_size` (0 disables)
    pub memtable_prefix_bloom_size_ratio: f64,

    /// Filter on whole user keys in addition to prefixes
    pub memtable_whole_key_filtering: bool,

    /// Prefix extractor for the memtable bloom filter
    pub prefix_extractor: Option<Arc<dyn SliceTransform>>,

    /// Operator used to resolve Merge records on reads
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    /// Allow overwriting the newest value of a key in place
    pub inplace_update_support: bool,

    /// Size of the striped lock table guarding in-place updates
    pub inplace_update_num_locks: usize,

    /// Turns puts into read-modify-write updates when in-place updates are on
    pub inplace_callback: Option<InplaceCallback>,

    /// Insert into the memtable through the concurrent-writer path
    pub allow_concurrent_memtable_write: bool,

    /// Decode every encoded entry and compare it to its inputs before insert
    pub paranoid_memtable_checks: bool,

    // -------------------------------------------------------------------------
    // Log Configuration
    // -------------------------------------------------------------------------
    /// Roll to a new log segment past this many bytes
    pub max_log_segment_size: usize,

    // -------------------------------------------------------------------------
    // Transaction Configuration
    // -------------------------------------------------------------------------
    /// Number of independently locked stripes in the lock manager
    pub num_lock_stripes: usize,

    /// Lock wait for writes issued outside a transaction
    pub default_lock_timeout: Duration,

    /// Lock wait for transactions that do not override it
    pub transaction_lock_timeout: Duration,

    /// Expiration for transactions that do not set their own; `None` never expires
    pub default_expiration: Option<Duration>,

    /// Max hops followed through the wait-for graph when detecting deadlocks
    pub deadlock_detect_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024 * 1024, // 64 MB
            arena_block_size: 0,
            memtable_prefix_bloom_size_ratio: 0.0,
            memtable_whole_key_filtering: false,
            prefix_extractor: None,
            merge_operator: None,
            inplace_update_support: false,
            inplace_update_num_locks: 10_000,
            inplace_callback: None,
            allow_concurrent_memtable_write: true,
            paranoid_memtable_checks: false,
            max_log_segment_size: 4 * 1024 * 1024, // 4 MB
            num_lock_stripes: 16,
            default_lock_timeout: Duration::from_millis(1000),
            transaction_lock_timeout: Duration::from_millis(1000),
            default_expiration: None,
            deadlock_detect_depth: 50,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("write_buffer_size", &self.write_buffer_size)
            .field("arena_block_size", &self.arena_block_size)
            .field("memtable_prefix_bloom_size_ratio", &self.memtable_prefix_bloom_size_ratio)
            .field("memtable_whole_key_filtering", &self.memtable_whole_key_filtering)
            .field("prefix_extractor", &self.prefix_extractor.as_ref().map(|p| p.name().to_string()))
            .field("merge_operator", &self.merge_operator.as_ref().map(|m| m.name().to_string()))
            .field("inplace_update_support", &self.inplace_update_support)
            .field("inplace_update_num_locks", &self.inplace_update_num_locks)
            .field("inplace_callback", &self.inplace_callback.is_some())
            .field("allow_concurrent_memtable_write", &self.allow_concurrent_memtable_write)
            .field("paranoid_memtable_checks", &self.paranoid_memtable_checks)
            .field("max_log_segment_size", &self.max_log_segment_size)
            .field("num_lock_stripes", &self.num_lock_stripes)
            .field("default_lock_timeout", &self.default_lock_timeout)
            .field("transaction_lock_timeout", &self.transaction_lock_timeout)
            .field("default_expiration", &self.default_expiration)
            .field("deadlock_detect_depth", &self.deadlock_detect_depth)
            .finish()
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Arena block size actually used: an eighth of the write buffer,
    /// clamped to [4 KB, 8 MB] and rounded to a 4 KB multiple
    pub fn effective_arena_block_size(&self) -> usize {
        const MIN: usize = 4 * 1024;
        const MAX: usize = 8 * 1024 * 1024;
        let raw = if self.arena_block_size > 0 {
            self.arena_block_size
        } else {
            self.write_buffer_size / 8
        };
        let clamped = raw.clamp(MIN, MAX);
        clamped.div_ceil(MIN) * MIN
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the memtable write buffer budget (in bytes)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the arena block size (in bytes)
    pub fn arena_block_size(mut self, size: usize) -> Self {
        self.config.arena_block_size = size;
        self
    }

    /// Enable the memtable bloom filter sized as a ratio of the write buffer
    pub fn memtable_prefix_bloom_size_ratio(mut self, ratio: f64) -> Self {
        self.config.memtable_prefix_bloom_size_ratio = ratio;
        self
    }

    /// Also filter whole keys
    pub fn memtable_whole_key_filtering(mut self, enabled: bool) -> Self {
        self.config.memtable_whole_key_filtering = enabled;
        self
    }

    /// Set the prefix extractor
    pub fn prefix_extractor(mut self, extractor: Arc<dyn SliceTransform>) -> Self {
        self.config.prefix_extractor = Some(extractor);
        self
    }

    /// Set the merge operator
    pub fn merge_operator(mut self, op: Arc<dyn MergeOperator>) -> Self {
        self.config.merge_operator = Some(op);
        self
    }

    /// Enable in-place updates with the given lock table size
    pub fn inplace_update_support(mut self, enabled: bool, num_locks: usize) -> Self {
        self.config.inplace_update_support = enabled;
        self.config.inplace_update_num_locks = num_locks.max(1);
        self
    }

    /// Route puts through `callback` when in-place updates are enabled
    pub fn inplace_callback(mut self, callback: InplaceCallback) -> Self {
        self.config.inplace_callback = Some(callback);
        self
    }

    /// Choose between the concurrent and exclusive memtable write paths
    pub fn allow_concurrent_memtable_write(mut self, enabled: bool) -> Self {
        self.config.allow_concurrent_memtable_write = enabled;
        self
    }

    /// Verify entries after encoding
    pub fn paranoid_memtable_checks(mut self, enabled: bool) -> Self {
        self.config.paranoid_memtable_checks = enabled;
        self
    }

    /// Set the log segment roll size (in bytes)
    pub fn max_log_segment_size(mut self, size: usize) -> Self {
        self.config.max_log_segment_size = size;
        self
    }

    /// Set the number of lock manager stripes
    pub fn num_lock_stripes(mut self, count: usize) -> Self {
        self.config.num_lock_stripes = count.max(1);
        self
    }

    /// Set the lock wait for non-transactional writes
    pub fn default_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_lock_timeout = timeout;
        self
    }

    /// Set the default lock wait for transactions
    pub fn transaction_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.transaction_lock_timeout = timeout;
        self
    }

    /// Set the expiration applied to transactions without their own
    pub fn default_expiration(mut self, expiration: Duration) -> Self {
        self.config.default_expiration = Some(expiration);
        self
    }

    /// Set the deadlock detection depth
    pub fn deadlock_detect_depth(mut self, depth: usize) -> Self {
        self.config.deadlock_detect_depth = depth;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Per-call Options
// =============================================================================

/// Options for a read
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Read as of this sequence; `None` reads the latest committed state
    pub snapshot: Option<SequenceNumber>,

    /// Stop materialising values in a multi-get once this many value bytes
    /// have been returned; the remaining keys report `Aborted`
    pub value_size_soft_limit: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            snapshot: None,
            value_size_soft_limit: usize::MAX,
        }
    }
}

impl ReadOptions {
    pub fn at(snapshot: SequenceNumber) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::default()
        }
    }
}

/// Options for a pessimistic transaction
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Pin a snapshot at begin; locked keys are then validated against it
    pub set_snapshot: bool,

    /// Fail lock waits that would close a cycle in the wait-for graph
    pub deadlock_detect: bool,

    /// Lock wait override; `None` uses `Config::transaction_lock_timeout`
    pub lock_timeout: Option<Duration>,

    /// Lifetime after which other parties may steal this transaction's locks
    pub expiration: Option<Duration>,

    /// Allow a named transaction to commit without `prepare`
    pub skip_prepare: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            set_snapshot: false,
            deadlock_detect: false,
            lock_timeout: None,
            expiration: None,
            skip_prepare: true,
        }
    }
}
