//! Log Writer
//!
//! Appends framed records to an in-memory segmented log and tracks which
//! segments must outlive purging because they hold unresolved prepared
//! transactions.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::Result;

use super::{LogEntry, LogRecord};

/// The durability service transactions and the engine write through
pub trait Durability: Send + Sync {
    /// Append `record`; returns the number of the segment it landed in
    fn write(&self, record: &LogRecord) -> Result<u64>;

    /// Keep segment `log_number` until a matching `release_log`
    fn retain_log(&self, log_number: u64);

    fn release_log(&self, log_number: u64);

    /// Oldest segment still holding an unresolved prepared section
    fn min_log_containing_prepared(&self) -> Option<u64>;
}

/// One log segment: a numbered run of framed entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    pub number: u64,
    pub data: Vec<u8>,
}

impl LogSegment {
    fn new(number: u64) -> Self {
        Self {
            number,
            data: Vec::new(),
        }
    }
}

struct WriterInner {
    /// Oldest first; the last one is being appended to
    segments: Vec<LogSegment>,
    next_lsn: u64,
    /// Segment number → outstanding prepared sections
    retained: BTreeMap<u64, usize>,
}

impl WriterInner {
    fn current_mut(&mut self) -> &mut LogSegment {
        if self.segments.is_empty() {
            self.segments.push(LogSegment::new(1));
        }
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }
}

/// Appends entries to the log
pub struct LogWriter {
    max_segment_size: usize,
    inner: Mutex<WriterInner>,
}

impl LogWriter {
    pub fn new(max_segment_size: usize) -> Self {
        Self {
            max_segment_size: max_segment_size.max(1),
            inner: Mutex::new(WriterInner {
                segments: vec![LogSegment::new(1)],
                next_lsn: 1,
                retained: BTreeMap::new(),
            }),
        }
    }

    /// Continue a recovered log: new entries go to a fresh segment after the
    /// recovered ones, numbered from `next_lsn`
    pub fn from_segments(max_segment_size: usize, mut segments: Vec<LogSegment>, next_lsn: u64) -> Self {
        let next_number = segments.last().map_or(1, |s| s.number + 1);
        segments.push(LogSegment::new(next_number));
        Self {
            max_segment_size: max_segment_size.max(1),
            inner: Mutex::new(WriterInner {
                segments,
                next_lsn: next_lsn.max(1),
                retained: BTreeMap::new(),
            }),
        }
    }

    /// Append an entry; returns `(lsn, segment number)`
    pub fn append(&self, record: &LogRecord) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        let frame = LogEntry::new(lsn, record.clone()).serialize()?;
        inner.next_lsn += 1;

        let segment = inner.current_mut();
        segment.data.extend_from_slice(&frame);
        let number = segment.number;

        if segment.data.len() >= self.max_segment_size {
            let size = segment.data.len();
            inner.segments.push(LogSegment::new(number + 1));
            tracing::info!(segment = number, size, next = number + 1, "rolled log segment");
        }
        Ok((lsn, number))
    }

    /// Copy of every live segment, oldest first
    pub fn segments(&self) -> Vec<LogSegment> {
        self.inner.lock().segments.clone()
    }

    pub fn current_log_number(&self) -> u64 {
        self.inner.lock().current_mut().number
    }

    /// LSN the next entry will get
    pub fn next_lsn(&self) -> u64 {
        self.inner.lock().next_lsn
    }

    /// Drop sealed segments numbered below `upto` that no prepared section
    /// still needs. Returns how many were dropped.
    pub fn purge_obsolete(&self, upto: u64) -> usize {
        let mut inner = self.inner.lock();
        let keep_from = inner
            .retained
            .keys()
            .next()
            .map_or(upto, |&oldest| oldest.min(upto));
        let current = inner.current_mut().number;

        let before = inner.segments.len();
        inner
            .segments
            .retain(|s| s.number >= keep_from || s.number == current);
        let purged = before - inner.segments.len();
        if purged > 0 {
            tracing::debug!(purged, keep_from, "purged obsolete log segments");
        }
        purged
    }
}

impl Durability for LogWriter {
    fn write(&self, record: &LogRecord) -> Result<u64> {
        self.append(record).map(|(_, number)| number)
    }

    fn retain_log(&self, log_number: u64) {
        *self.inner.lock().retained.entry(log_number).or_insert(0) += 1;
    }

    fn release_log(&self, log_number: u64) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.retained.get_mut(&log_number) {
            *count -= 1;
            if *count == 0 {
                inner.retained.remove(&log_number);
            }
        }
    }

    fn min_log_containing_prepared(&self) -> Option<u64> {
        self.inner.lock().retained.keys().next().copied()
    }
}
