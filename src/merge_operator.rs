//! Merge operators
//!
//! A merge operator folds partial updates ("operands") into a value without a
//! read-modify-write cycle. Reads collect operands newest-first while walking
//! versions of a key and finish once they hit a base value, a tombstone, or
//! the end of the data; the operator then combines them oldest-first.

use crate::error::{KestrelError, Result};

/// Associative combine function for partial updates
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &str;

    /// Combine `operands` (oldest first) on top of `base`, which is `None`
    /// when the key had no value or was deleted underneath the operands.
    fn full_merge(&self, key: &[u8], base: Option<&[u8]>, operands: &[&[u8]]) -> Result<Vec<u8>>;

    /// Consulted after each operand is collected (`operands` newest first).
    /// Returning `true` finalises the read immediately without a base value.
    fn should_merge(&self, _operands: &[Vec<u8>]) -> bool {
        false
    }
}

/// Operands collected while walking the versions of one key
#[derive(Debug, Default, Clone)]
pub struct MergeContext {
    /// Newest first, in the order they were encountered
    operands: Vec<Vec<u8>>,
}

impl MergeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operand: Vec<u8>) {
        self.operands.push(operand);
    }

    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operands.len()
    }

    pub fn operands_newest_first(&self) -> &[Vec<u8>] {
        &self.operands
    }

    pub fn clear(&mut self) {
        self.operands.clear();
    }

    /// Run `op` over the collected operands on top of `base`
    pub fn merge(&self, op: &dyn MergeOperator, key: &[u8], base: Option<&[u8]>) -> Result<Vec<u8>> {
        let oldest_first: Vec<&[u8]> = self.operands.iter().rev().map(Vec::as_slice).collect();
        op.full_merge(key, base, &oldest_first)
    }
}

/// Finalise a read: merge if an operator is present, otherwise the caller
/// misconfigured the store.
pub fn resolve(
    op: Option<&dyn MergeOperator>,
    ctx: &MergeContext,
    key: &[u8],
    base: Option<&[u8]>,
) -> Result<Vec<u8>> {
    match op {
        Some(op) => ctx.merge(op, key, base),
        None => Err(KestrelError::invalid("merge operator is not configured")),
    }
}

/// Concatenates operands onto the base, optionally separated by a delimiter
#[derive(Debug, Clone, Default)]
pub struct StringAppendOperator {
    delimiter: Option<u8>,
}

impl StringAppendOperator {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter: Some(delimiter),
        }
    }
}

impl MergeOperator for StringAppendOperator {
    fn name(&self) -> &str {
        "StringAppendOperator"
    }

    fn full_merge(&self, _key: &[u8], base: Option<&[u8]>, operands: &[&[u8]]) -> Result<Vec<u8>> {
        let mut out = base.map(<[u8]>::to_vec).unwrap_or_default();
        for operand in operands {
            if !out.is_empty() {
                if let Some(d) = self.delimiter {
                    out.push(d);
                }
            }
            out.extend_from_slice(operand);
        }
        Ok(out)
    }
}

/// Treats values and operands as little-endian u64 counters and adds them
#[derive(Debug, Clone, Copy, Default)]
pub struct UInt64AddOperator;

impl UInt64AddOperator {
    fn decode(bytes: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            KestrelError::corruption(format!("u64 operand has {} bytes", bytes.len()))
        })?;
        Ok(u64::from_le_bytes(raw))
    }
}

impl MergeOperator for UInt64AddOperator {
    fn name(&self) -> &str {
        "UInt64AddOperator"
    }

    fn full_merge(&self, _key: &[u8], base: Option<&[u8]>, operands: &[&[u8]]) -> Result<Vec<u8>> {
        let mut total = match base {
            Some(b) => Self::decode(b)?,
            None => 0,
        };
        for operand in operands {
            total = total.wrapping_add(Self::decode(operand)?);
        }
        Ok(total.to_le_bytes().to_vec())
    }
}

/// Last operand wins; lets reads stop at the first operand they meet.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceOperator;

impl MergeOperator for ReplaceOperator {
    fn name(&self) -> &str {
        "ReplaceOperator"
    }

    fn full_merge(&self, _key: &[u8], base: Option<&[u8]>, operands: &[&[u8]]) -> Result<Vec<u8>> {
        Ok(operands
            .last()
            .map(|o| o.to_vec())
            .or_else(|| base.map(<[u8]>::to_vec))
            .unwrap_or_default())
    }

    fn should_merge(&self, operands: &[Vec<u8>]) -> bool {
        !operands.is_empty()
    }
}
