//! Diagnostic reports emitted by the forwarder
//!
//! Nothing in the pipeline raises into producer threads. Every failure is
//! turned into a [`Report`] and handed to a [`Reporter`], which by default
//! writes it out as a `tracing` event.

use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    /// Mandatory configuration missing or malformed; the forwarder stays stopped
    ConfigurationError(String),

    /// An option was out of range and replaced by its default
    ConfigurationDefaulted {
        option: &'static str,
        reason: String,
    },

    /// A record was rejected because the queue was full
    QueueOverflow { dropped_total: u64 },

    /// A record was rejected because the forwarder was not running
    NotRunning { dropped_total: u64 },

    /// A single record could not be encoded and was skipped
    RecordSkipped { reason: String },

    /// A batch was given up on after its final attempt
    BatchDropped {
        batch_id: Uuid,
        records: usize,
        attempts: u32,
        reason: String,
    },

    /// Drain did not finish in time
    ShutdownTimeout { unflushed: u64 },

    /// start() or stop() called in a state where it has no effect
    IgnoredLifecycleCall { call: &'static str, state: String },

    Started { sink: String },

    Stopped {
        delivered_records: u64,
        dropped_records: u64,
    },
}

/// Receiver of asynchronous reports.
pub trait Reporter: Send + Sync {
    fn report(&self, report: &Report);
}

/// Reports through `tracing` at the severity of each report.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

/// Overflow warnings are logged for the first drop and every this many after.
const OVERFLOW_LOG_EVERY: u64 = 1000;

impl Reporter for TracingReporter {
    fn report(&self, report: &Report) {
        match report {
            Report::ConfigurationError(msg) => {
                error!("Log forwarder not started: {}", msg);
            }
            Report::ConfigurationDefaulted { option, reason } => {
                warn!("Option {} replaced by its default: {}", option, reason);
            }
            Report::QueueOverflow { dropped_total } => {
                if *dropped_total == 1 || dropped_total % OVERFLOW_LOG_EVERY == 0 {
                    warn!(
                        "Record queue is full, dropping log record ({} dropped so far)",
                        dropped_total
                    );
                }
            }
            Report::NotRunning { dropped_total } => {
                if *dropped_total == 1 || dropped_total % OVERFLOW_LOG_EVERY == 0 {
                    warn!(
                        "Log forwarder is not running, dropping log record ({} dropped so far)",
                        dropped_total
                    );
                }
            }
            Report::RecordSkipped { reason } => {
                warn!("Skipping malformed log record: {}", reason);
            }
            Report::BatchDropped {
                batch_id,
                records,
                attempts,
                reason,
            } => {
                error!(
                    "Dropped batch {} with {} records after {} attempts: {}",
                    batch_id, records, attempts, reason
                );
            }
            Report::ShutdownTimeout { unflushed } => {
                error!(
                    "Log forwarder shutdown timed out, {} records were not flushed",
                    unflushed
                );
            }
            Report::IgnoredLifecycleCall { call, state } => {
                warn!("Ignoring {}() while {}", call, state);
            }
            Report::Started { sink } => {
                info!("Log forwarder started, delivering to {}", sink);
            }
            Report::Stopped {
                delivered_records,
                dropped_records,
            } => {
                info!(
                    "Log forwarder stopped - delivered {} records, dropped {}",
                    delivered_records, dropped_records
                );
            }
        }
    }
}

/// Keeps every report in memory. Handy for hosts that poll for status and
/// for tests.
#[derive(Debug, Default, Clone)]
pub struct CollectingReporter {
    reports: Arc<Mutex<Vec<Report>>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, predicate: impl Fn(&Report) -> bool) -> usize {
        self.reports().iter().filter(|r| predicate(r)).count()
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, report: &Report) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.clone());
        }
    }
}

/// Fans a report out to several reporters.
pub struct Reporters(Vec<Arc<dyn Reporter>>);

impl Reporters {
    pub fn new(reporters: Vec<Arc<dyn Reporter>>) -> Self {
        Self(reporters)
    }
}

impl Reporter for Reporters {
    fn report(&self, report: &Report) {
        for reporter in &self.0 {
            reporter.report(report);
        }
    }
}
