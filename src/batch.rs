//! Accumulates queued records into batches on count, size and linger triggers

use crate::record::{Batch, LogRecord};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchThresholds {
    /// Flush once this many records are open
    pub max_count: usize,

    /// Flush once the estimated encoded size reaches this many bytes
    pub max_bytes: usize,

    /// Flush once the oldest open record has waited this long
    pub linger: Duration,
}

impl Default for BatchThresholds {
    fn default() -> Self {
        Self {
            max_count: 4096,
            max_bytes: 512 * 1024,
            linger: Duration::from_millis(2000),
        }
    }
}

/// The open batch owned by the sender loop.
#[derive(Debug)]
pub struct BatchAccumulator {
    thresholds: BatchThresholds,
    records: Vec<LogRecord>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(thresholds: BatchThresholds) -> Self {
        Self {
            thresholds,
            records: Vec::new(),
            bytes: 0,
            opened_at: None,
        }
    }

    pub fn add(&mut self, record: LogRecord) {
        if self.records.is_empty() {
            self.opened_at = Some(Instant::now());
        }

        self.bytes += record.estimated_size();
        self.records.push(record);
    }

    pub fn should_flush(&self) -> bool {
        self.should_flush_at(Instant::now())
    }

    /// Same as [`should_flush`](Self::should_flush) evaluated at `now`.
    pub fn should_flush_at(&self, now: Instant) -> bool {
        if self.records.is_empty() {
            return false;
        }

        self.records.len() >= self.thresholds.max_count
            || self.bytes >= self.thresholds.max_bytes
            || self
                .deadline()
                .is_some_and(|deadline| now >= deadline)
    }

    /// Hand out the open batch and start an empty one.
    pub fn take_and_reset(&mut self) -> Batch {
        let records = std::mem::take(&mut self.records);
        let bytes = std::mem::replace(&mut self.bytes, 0);
        self.opened_at = None;

        Batch::new(records, bytes)
    }

    /// Instant at which the open batch lingers out. `None` when nothing is open
    /// or the linger is too long to represent.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at
            .and_then(|opened| opened.checked_add(self.thresholds.linger))
    }

    pub fn time_until_deadline(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn thresholds(&self) -> &BatchThresholds {
        &self.thresholds
    }
}
