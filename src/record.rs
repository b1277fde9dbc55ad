//! Log record and batch data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

/// Fixed cost charged for every encoded field on top of its value length.
pub const FIELD_OVERHEAD_BYTES: usize = 8;

/// Fixed cost charged once per record.
pub const RECORD_OVERHEAD_BYTES: usize = 32;

/// Time format used for the human readable `time` field.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRACE" | "VERBOSE" => LogLevel::Trace,
            "DEBUG" => LogLevel::Debug,
            "INFO" | "INFORMATION" => LogLevel::Info,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" | "ERR" | "FATAL" | "CRITICAL" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// Snapshot of one application log event, taken when it is appended.
///
/// Records are never mutated once they reach the queue; the builder methods
/// consume `self` and are meant to be used by the producer before `append`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub logger: String,
    pub thread: String,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub throwable: Option<String>,
    pub markers: Vec<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            logger: logger.into(),
            thread: current_thread_name(),
            message: message.into(),
            context: BTreeMap::new(),
            throwable: None,
            markers: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = thread.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_throwable(mut self, throwable: impl Into<String>) -> Self {
        self.throwable = Some(throwable.into());
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.markers.push(marker.into());
        self
    }

    /// Ordered destination fields for this record.
    ///
    /// Context entries with an empty key are skipped, the `marker` field is
    /// only present when the record carries markers.
    pub fn fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(6 + self.context.len());

        fields.push((
            "time".to_string(),
            self.timestamp.format(TIME_FORMAT).to_string(),
        ));
        fields.push(("level".to_string(), self.level.to_string()));
        fields.push(("thread".to_string(), self.thread.clone()));
        fields.push(("logger".to_string(), self.logger.clone()));
        fields.push(("message".to_string(), self.message.clone()));

        for (key, value) in &self.context {
            if key.is_empty() {
                continue;
            }
            fields.push((format!("mdc.{}", key), value.clone()));
        }

        if let Some(throwable) = &self.throwable {
            fields.push(("throwable".to_string(), throwable.clone()));
        }

        if !self.markers.is_empty() {
            fields.push(("marker".to_string(), self.markers.join(",")));
        }

        fields
    }

    /// Check that every destination field can be encoded.
    pub fn validate(&self) -> Result<(), String> {
        match self.fields().into_iter().find(|(_, value)| value.contains('\0')) {
            Some((key, _)) => Err(format!(
                "field '{}' of logger '{}' contains a NUL byte",
                key, self.logger
            )),
            None => Ok(()),
        }
    }

    /// Unix seconds of the record timestamp.
    pub fn unix_time(&self) -> i64 {
        self.timestamp.timestamp()
    }

    /// Approximate encoded size of the record in bytes.
    pub fn estimated_size(&self) -> usize {
        let context: usize = self
            .context
            .iter()
            .map(|(k, v)| k.len() + v.len() + 4 + FIELD_OVERHEAD_BYTES)
            .sum();
        let markers: usize = self.markers.iter().map(|m| m.len() + 1).sum();

        // "yyyy-mm-dd hh:mm:ss.sss" and the widest level name
        let fixed_values = 23 + 5 + self.thread.len() + self.logger.len() + self.message.len();
        let throwable = self
            .throwable
            .as_ref()
            .map_or(0, |t| t.len() + FIELD_OVERHEAD_BYTES);

        RECORD_OVERHEAD_BYTES
            + fixed_values
            + 5 * FIELD_OVERHEAD_BYTES
            + context
            + throwable
            + markers
    }
}

/// Ordered group of records handed to a sink as one unit.
#[derive(Clone, Debug)]
pub struct Batch {
    pub batch_id: Uuid,
    pub records: Vec<LogRecord>,
    pub created_at: Instant,
    pub approx_bytes: usize,
}

impl Batch {
    pub fn new(records: Vec<LogRecord>, approx_bytes: usize) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            records,
            created_at: Instant::now(),
            approx_bytes,
        }
    }

    pub fn from_records(records: Vec<LogRecord>) -> Self {
        let approx_bytes = records.iter().map(LogRecord::estimated_size).sum();
        Self::new(records, approx_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Take out the records that cannot be encoded, returning why each failed.
    pub fn remove_malformed(&mut self) -> Vec<String> {
        let mut reasons = Vec::new();
        let mut removed_bytes = 0;

        self.records.retain(|record| match record.validate() {
            Ok(()) => true,
            Err(reason) => {
                removed_bytes += record.estimated_size();
                reasons.push(reason);
                false
            }
        });

        self.approx_bytes = self.approx_bytes.saturating_sub(removed_bytes);
        reasons
    }
}

fn current_thread_name() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}
