//! Write batch
//!
//! An ordered group of writes applied as a unit. Each operation names the
//! column family it targets. Save points mark prefixes of the batch that a
//! caller can truncate back to.

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, Result};

/// Numeric column family handle
pub type ColumnFamilyId = u32;

/// Column family every engine starts with
pub const DEFAULT_COLUMN_FAMILY: ColumnFamilyId = 0;

/// A single write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put {
        cf: ColumnFamilyId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamilyId,
        key: Vec<u8>,
    },
    SingleDelete {
        cf: ColumnFamilyId,
        key: Vec<u8>,
    },
    /// Deletes `[begin, end)`
    DeleteRange {
        cf: ColumnFamilyId,
        begin: Vec<u8>,
        end: Vec<u8>,
    },
    Merge {
        cf: ColumnFamilyId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

impl BatchOp {
    pub fn column_family(&self) -> ColumnFamilyId {
        match self {
            BatchOp::Put { cf, .. }
            | BatchOp::Delete { cf, .. }
            | BatchOp::SingleDelete { cf, .. }
            | BatchOp::DeleteRange { cf, .. }
            | BatchOp::Merge { cf, .. } => *cf,
        }
    }

    /// The point key written, or the range start for `DeleteRange`
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. }
            | BatchOp::Delete { key, .. }
            | BatchOp::SingleDelete { key, .. }
            | BatchOp::Merge { key, .. } => key,
            BatchOp::DeleteRange { begin, .. } => begin,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            BatchOp::Put { key, value, .. } | BatchOp::Merge { key, value, .. } => {
                key.len() + value.len()
            }
            BatchOp::Delete { key, .. } | BatchOp::SingleDelete { key, .. } => key.len(),
            BatchOp::DeleteRange { begin, end, .. } => begin.len() + end.len(),
        }
    }
}

/// Visitor over a batch's operations, in insertion order
pub trait WriteBatchHandler {
    fn put(&mut self, cf: ColumnFamilyId, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, cf: ColumnFamilyId, key: &[u8]) -> Result<()>;

    fn single_delete(&mut self, cf: ColumnFamilyId, key: &[u8]) -> Result<()>;

    fn delete_range(&mut self, cf: ColumnFamilyId, begin: &[u8], end: &[u8]) -> Result<()>;

    fn merge(&mut self, cf: ColumnFamilyId, key: &[u8], value: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SavePoint {
    count: usize,
    size: usize,
}

/// Ordered group of writes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    data_size: usize,
    #[serde(skip)]
    save_points: Vec<SavePoint>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: ColumnFamilyId, key: &[u8], value: &[u8]) {
        self.push(BatchOp::Put {
            cf,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn delete(&mut self, cf: ColumnFamilyId, key: &[u8]) {
        self.push(BatchOp::Delete {
            cf,
            key: key.to_vec(),
        });
    }

    pub fn single_delete(&mut self, cf: ColumnFamilyId, key: &[u8]) {
        self.push(BatchOp::SingleDelete {
            cf,
            key: key.to_vec(),
        });
    }

    pub fn delete_range(&mut self, cf: ColumnFamilyId, begin: &[u8], end: &[u8]) {
        self.push(BatchOp::DeleteRange {
            cf,
            begin: begin.to_vec(),
            end: end.to_vec(),
        });
    }

    pub fn merge(&mut self, cf: ColumnFamilyId, key: &[u8], value: &[u8]) {
        self.push(BatchOp::Merge {
            cf,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    fn push(&mut self, op: BatchOp) {
        self.data_size += op.payload_size();
        self.ops.push(op);
    }

    /// Append every operation of `other`
    pub fn append(&mut self, other: &WriteBatch) {
        for op in &other.ops {
            self.push(op.clone());
        }
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Number of operations; each consumes one sequence number when applied
    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Key and value bytes held
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.data_size = 0;
        self.save_points.clear();
    }

    /// Feed every operation to `handler`, stopping at the first error
    pub fn iterate(&self, handler: &mut dyn WriteBatchHandler) -> Result<()> {
        for op in &self.ops {
            match op {
                BatchOp::Put { cf, key, value } => handler.put(*cf, key, value)?,
                BatchOp::Delete { cf, key } => handler.delete(*cf, key)?,
                BatchOp::SingleDelete { cf, key } => handler.single_delete(*cf, key)?,
                BatchOp::DeleteRange { cf, begin, end } => handler.delete_range(*cf, begin, end)?,
                BatchOp::Merge { cf, key, value } => handler.merge(*cf, key, value)?,
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Save Points
    // -------------------------------------------------------------------------

    pub fn set_save_point(&mut self) {
        self.save_points.push(SavePoint {
            count: self.ops.len(),
            size: self.data_size,
        });
    }

    /// Drop every operation added since the newest save point and remove it
    pub fn rollback_to_save_point(&mut self) -> Result<()> {
        let sp = self.save_points.pop().ok_or(KestrelError::NotFound)?;
        self.ops.truncate(sp.count);
        self.data_size = sp.size;
        Ok(())
    }

    /// Forget the newest save point without touching the operations
    pub fn pop_save_point(&mut self) -> Result<()> {
        self.save_points.pop().map(|_| ()).ok_or(KestrelError::NotFound)
    }

    pub fn num_save_points(&self) -> usize {
        self.save_points.len()
    }
}
