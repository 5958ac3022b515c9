//! Log entry definitions
//!
//! Defines the records written to the log and their framing.

use serde::{Deserialize, Serialize};

use crate::error::{KestrelError, Result};
use crate::key::SequenceNumber;
use crate::txn::{ColumnFamilyId, WriteBatch};

/// Size of the frame header: LSN (8) + CRC (4) + length (4)
pub const HEADER_SIZE: usize = 16;

/// What a log entry records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A column family was created
    ColumnFamily { id: ColumnFamilyId, name: String },

    /// Batch applied directly, its first operation at `sequence`
    Batch {
        sequence: SequenceNumber,
        batch: WriteBatch,
    },

    /// Pending batch of a prepared transaction; not applied until committed
    Prepare { name: String, batch: WriteBatch },

    /// Resolves a prepared transaction. Its prepared batch followed by the
    /// commit-time batch were applied starting at `sequence`.
    Commit {
        name: String,
        sequence: SequenceNumber,
        commit_time_batch: WriteBatch,
    },

    /// Discards a prepared transaction
    Rollback { name: String },
}

/// A single framed entry in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log Sequence Number - monotonically increasing across segments
    pub lsn: u64,

    pub record: LogRecord,
}

impl LogEntry {
    pub fn new(lsn: u64, record: LogRecord) -> Self {
        Self { lsn, record }
    }

    /// Frame as `[lsn][crc][len][bincode(record)]`
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let data = bincode::serialize(&self.record)?;
        let len = u32::try_from(data.len())
            .map_err(|_| KestrelError::invalid("log record larger than 4 GB"))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + data.len());
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&data);
        Ok(out)
    }

    /// Parse one frame from the start of `bytes`, verifying its checksum
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::parse(bytes)
            .ok_or_else(|| KestrelError::corruption("log frame shorter than its header"))?;
        let end = HEADER_SIZE + header.len;
        if bytes.len() < end {
            return Err(KestrelError::corruption(format!(
                "log frame at lsn {} truncated: need {} bytes, have {}",
                header.lsn,
                end,
                bytes.len()
            )));
        }
        let data = &bytes[HEADER_SIZE..end];
        if crc32fast::hash(data) != header.crc {
            return Err(KestrelError::corruption(format!(
                "checksum mismatch in log frame at lsn {}",
                header.lsn
            )));
        }
        let record = bincode::deserialize(data)?;
        Ok(Self {
            lsn: header.lsn,
            record,
        })
    }

    /// Bytes this entry occupies once framed
    pub fn serialized_size(&self) -> Result<usize> {
        Ok(HEADER_SIZE + bincode::serialized_size(&self.record)? as usize)
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: usize,
}

impl FrameHeader {
    pub(crate) fn parse(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..HEADER_SIZE)?;
        let lsn = u64::from_le_bytes(header[0..8].try_into().ok()?);
        let crc = u32::from_le_bytes(header[8..12].try_into().ok()?);
        let len = u32::from_le_bytes(header[12..16].try_into().ok()?) as usize;
        Some(Self { lsn, crc, len })
    }
}
