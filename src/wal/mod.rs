//! Write-Ahead Log (WAL) Module
//!
//! Durability service for batches and two-phase transaction markers.
//!
//! ## Responsibilities
//! - Append log records before their writes become visible
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Retain segments holding unresolved prepared transactions
//! - Recovery that stops at the first torn or corrupted entry
//!
//! Segments live in memory; a segment is just the concatenation of its frames.
//!
//! ## Frame Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Record │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Record │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```

mod entry;
mod reader;
mod recovery;
mod writer;

pub use entry::{LogEntry, LogRecord, HEADER_SIZE};
pub use reader::LogReader;
pub use recovery::{LogRecovery, RecoveryResult};
pub use writer::{Durability, LogSegment, LogWriter};
