//! Log Recovery
//!
//! Replays segments in order, stopping at the first torn or corrupted entry.

use super::{LogEntry, LogReader, LogSegment};

/// Handles log recovery
pub struct LogRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted entries hit (recovery stops at the first)
    pub entries_corrupted: u64,

    /// Last valid LSN, 0 if none
    pub last_lsn: u64,

    /// Whether anything after the last valid entry was discarded
    pub was_truncated: bool,
}

impl LogRecovery {
    /// Recover every valid entry, oldest first, each paired with the number
    /// of the segment holding it.
    ///
    /// Everything after the first bad entry is discarded, including later
    /// segments: an entry missing from the middle of the log would make later
    /// ones unsafe to apply. An LSN that does not increase counts as corruption.
    pub fn recover(segments: &[LogSegment]) -> (Vec<(u64, LogEntry)>, RecoveryResult) {
        let mut entries = Vec::new();
        let mut result = RecoveryResult::default();

        'segments: for (idx, segment) in segments.iter().enumerate() {
            let mut reader = LogReader::new(&segment.data);
            loop {
                match reader.next_entry() {
                    Ok(Some(entry)) => {
                        if entry.lsn <= result.last_lsn {
                            tracing::warn!(
                                segment = segment.number,
                                lsn = entry.lsn,
                                last_lsn = result.last_lsn,
                                "log sequence went backwards"
                            );
                            result.entries_corrupted += 1;
                            result.was_truncated = true;
                            break 'segments;
                        }
                        result.last_lsn = entry.lsn;
                        result.entries_recovered += 1;
                        entries.push((segment.number, entry));
                    }
                    Ok(None) => {
                        if reader.was_truncated() {
                            tracing::warn!(
                                segment = segment.number,
                                offset = reader.position(),
                                "partial entry at log tail"
                            );
                            result.was_truncated = true;
                            if idx + 1 < segments.len() {
                                break 'segments;
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(segment = segment.number, error = %e, "corrupted log entry");
                        result.entries_corrupted += 1;
                        result.was_truncated = true;
                        break 'segments;
                    }
                }
            }
        }

        tracing::info!(
            recovered = result.entries_recovered,
            corrupted = result.entries_corrupted,
            last_lsn = result.last_lsn,
            truncated = result.was_truncated,
            "log recovery finished"
        );
        (entries, result)
    }

    /// Check log integrity without keeping the entries
    pub fn verify(segments: &[LogSegment]) -> RecoveryResult {
        Self::recover(segments).1
    }
}
