//! Bump allocator backing memtable records
//!
//! Memory is carved from fixed-size blocks. Each allocation is a `BytesMut`
//! view split off the current block, so a record's bytes never move and stay
//! alive as long as the memtable holds the view. Nothing is freed per record:
//! a block's memory is released once the memtable that owns every view into
//! it is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

/// Bump allocator over fixed-size blocks
pub struct Arena {
    block_size: usize,
    /// Unused tail of the current block
    current: Mutex<BytesMut>,
    /// Total bytes reserved from the system (all blocks)
    allocated: CachePadded<AtomicUsize>,
    /// Mirror of `current.len()` readable without the lock
    unused: AtomicUsize,
    blocks: AtomicUsize,
}

impl Arena {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(64),
            current: Mutex::new(BytesMut::new()),
            allocated: CachePadded::new(AtomicUsize::new(0)),
            unused: AtomicUsize::new(0),
            blocks: AtomicUsize::new(0),
        }
    }

    /// Reserve `len` zeroed bytes.
    ///
    /// Requests larger than a quarter block get a dedicated block so that the
    /// tail of the current block is not wasted.
    pub fn allocate(&self, len: usize) -> BytesMut {
        if len > self.block_size / 4 {
            return self.new_block(len);
        }

        let mut current = self.current.lock();
        if current.len() < len {
            *current = self.new_block(self.block_size);
        }
        let out = current.split_to(len);
        self.unused.store(current.len(), Ordering::Relaxed);
        out
    }

    fn new_block(&self, len: usize) -> BytesMut {
        let mut block = BytesMut::with_capacity(len);
        block.resize(len, 0);
        self.allocated.fetch_add(len, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
        block
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes reserved across all blocks
    pub fn memory_allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Bytes still free in the current block
    pub fn allocated_and_unused(&self) -> usize {
        self.unused.load(Ordering::Relaxed)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.load(Ordering::Relaxed)
    }
}
