//! Log Reader
//!
//! Reads framed entries back out of one segment's bytes.

use crate::error::Result;

use super::entry::FrameHeader;
use super::{LogEntry, HEADER_SIZE};

/// Sequential reader over one segment
pub struct LogReader<'a> {
    data: &'a [u8],
    position: usize,
    truncated: bool,
    failed: bool,
}

impl<'a> LogReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            truncated: false,
            failed: false,
        }
    }

    /// Read the next entry.
    ///
    /// A partial frame at the tail (torn write) ends the segment with
    /// `Ok(None)` and sets [`was_truncated`](Self::was_truncated). A complete
    /// frame that fails its checksum is `Corruption`.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        let rest = &self.data[self.position..];
        if rest.is_empty() {
            return Ok(None);
        }
        let Some(header) = FrameHeader::parse(rest) else {
            self.truncated = true;
            return Ok(None);
        };
        if rest.len() < HEADER_SIZE + header.len {
            self.truncated = true;
            return Ok(None);
        }
        let entry = LogEntry::deserialize(rest)?;
        self.position += HEADER_SIZE + header.len;
        Ok(Some(entry))
    }

    /// Byte offset just past the last entry read
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for LogReader<'_> {
    type Item = Result<LogEntry>;

    /// Stops after the first error
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
