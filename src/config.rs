//! Configuration management for the log forwarder

use crate::batch::BatchThresholds;
use crate::buffer::MAX_QUEUE_CAPACITY;
use crate::encoding::CompressionMode;
use crate::report::Report;
use crate::retry::{BackoffStrategy, RetryPolicy};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BATCH_COUNT_THRESHOLD: usize = 4096;
const DEFAULT_BATCH_SIZE_THRESHOLD_BYTES: usize = 512 * 1024;
const DEFAULT_LINGER: Duration = Duration::from_millis(2000);
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_QUEUE_BYTE_BUDGET: usize = 100 * 1024 * 1024;
const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_BASE_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(50);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Largest batch the ingestion service accepts in one request.
pub const MAX_BATCH_SIZE_THRESHOLD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URI of the ingestion service
    pub endpoint: String,

    /// Credential id
    pub access_key_id: String,

    /// Credential secret
    pub access_key_secret: String,

    /// Destination namespace
    pub project: String,

    /// Destination sub-namespace inside the project
    pub logstore: String,

    /// Topic tag attached to every batch
    pub topic: String,

    /// Source tag attached to every batch
    pub source: String,

    /// Flush once a batch holds this many records
    pub batch_count_threshold: usize,

    /// Flush once a batch reaches this estimated size
    pub batch_size_threshold_bytes: usize,

    /// Flush once the oldest record in a batch has waited this long
    pub linger: Duration,

    /// Records the queue holds before new ones are dropped
    pub queue_capacity: usize,

    /// Estimated bytes the queue holds before new records are dropped
    pub queue_byte_budget: usize,

    /// Retries after the first delivery attempt
    pub max_retries: u32,

    /// Delay unit between retries
    pub base_retry_backoff: Duration,

    /// Upper bound for any single retry delay
    pub max_retry_backoff: Duration,

    /// Linear or exponential growth of retry delays
    pub backoff_strategy: BackoffStrategy,

    /// Body compression on the wire
    pub compression: CompressionMode,

    /// Timeout for one HTTP request
    pub http_timeout: Duration,

    /// How long stop() waits for the queue to drain
    pub drain_timeout: Duration,

    /// Idle wait of the sender loop when no batch is open
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key_id: String::new(),
            access_key_secret: String::new(),
            project: String::new(),
            logstore: String::new(),
            topic: String::new(),
            source: String::new(),
            batch_count_threshold: DEFAULT_BATCH_COUNT_THRESHOLD,
            batch_size_threshold_bytes: DEFAULT_BATCH_SIZE_THRESHOLD_BYTES,
            linger: DEFAULT_LINGER,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_byte_budget: DEFAULT_QUEUE_BYTE_BUDGET,
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_backoff: DEFAULT_BASE_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            backoff_strategy: BackoffStrategy::Linear,
            compression: CompressionMode::None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl Config {
    /// Load configuration from `LOG_FORWARDER_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        let strings: [(&str, &mut String); 7] = [
            ("LOG_FORWARDER_ENDPOINT", &mut config.endpoint),
            ("LOG_FORWARDER_ACCESS_KEY_ID", &mut config.access_key_id),
            ("LOG_FORWARDER_ACCESS_KEY_SECRET", &mut config.access_key_secret),
            ("LOG_FORWARDER_PROJECT", &mut config.project),
            ("LOG_FORWARDER_LOGSTORE", &mut config.logstore),
            ("LOG_FORWARDER_TOPIC", &mut config.topic),
            ("LOG_FORWARDER_SOURCE", &mut config.source),
        ];
        for (name, slot) in strings {
            if let Ok(value) = env::var(name) {
                *slot = value;
            }
        }

        parse_env("LOG_FORWARDER_BATCH_COUNT", &mut config.batch_count_threshold);
        parse_env("LOG_FORWARDER_BATCH_BYTES", &mut config.batch_size_threshold_bytes);
        parse_env("LOG_FORWARDER_QUEUE_CAPACITY", &mut config.queue_capacity);
        parse_env("LOG_FORWARDER_QUEUE_BYTES", &mut config.queue_byte_budget);
        parse_env("LOG_FORWARDER_MAX_RETRIES", &mut config.max_retries);
        parse_millis_env("LOG_FORWARDER_LINGER_MS", &mut config.linger);
        parse_millis_env("LOG_FORWARDER_BASE_BACKOFF_MS", &mut config.base_retry_backoff);
        parse_millis_env("LOG_FORWARDER_MAX_BACKOFF_MS", &mut config.max_retry_backoff);
        parse_millis_env("LOG_FORWARDER_HTTP_TIMEOUT_MS", &mut config.http_timeout);
        parse_millis_env("LOG_FORWARDER_DRAIN_TIMEOUT_MS", &mut config.drain_timeout);
        parse_millis_env("LOG_FORWARDER_POLL_INTERVAL_MS", &mut config.poll_interval);

        if let Ok(strategy) = env::var("LOG_FORWARDER_BACKOFF") {
            match BackoffStrategy::parse(&strategy) {
                Some(strategy) => config.backoff_strategy = strategy,
                None => warn!("Ignoring LOG_FORWARDER_BACKOFF={}: unknown strategy", strategy),
            }
        }

        if let Ok(compression) = env::var("LOG_FORWARDER_COMPRESSION") {
            match CompressionMode::parse(&compression) {
                Some(mode) => config.compression = mode,
                None => warn!(
                    "Ignoring LOG_FORWARDER_COMPRESSION={}: unknown compression mode",
                    compression
                ),
            }
        }

        config
    }

    /// Replace out-of-range tuning values with their defaults.
    ///
    /// Returns one report per replaced option.
    pub fn sanitize(&mut self) -> Vec<Report> {
        let mut reports = Vec::new();
        let mut defaulted = |option: &'static str, reason: String| {
            reports.push(Report::ConfigurationDefaulted { option, reason });
        };

        if self.batch_count_threshold == 0 {
            defaulted("batch_count_threshold", "must be greater than 0".to_string());
            self.batch_count_threshold = DEFAULT_BATCH_COUNT_THRESHOLD;
        }

        if self.batch_size_threshold_bytes == 0
            || self.batch_size_threshold_bytes > MAX_BATCH_SIZE_THRESHOLD_BYTES
        {
            defaulted(
                "batch_size_threshold_bytes",
                format!(
                    "{} is outside 1..={}",
                    self.batch_size_threshold_bytes, MAX_BATCH_SIZE_THRESHOLD_BYTES
                ),
            );
            self.batch_size_threshold_bytes = DEFAULT_BATCH_SIZE_THRESHOLD_BYTES;
        }

        if self.linger.is_zero() {
            defaulted("linger", "must be greater than 0".to_string());
            self.linger = DEFAULT_LINGER;
        }

        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            defaulted(
                "queue_capacity",
                format!(
                    "{} is outside 1..={}",
                    self.queue_capacity, MAX_QUEUE_CAPACITY
                ),
            );
            self.queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }

        if self.queue_byte_budget == 0 {
            defaulted("queue_byte_budget", "must be greater than 0".to_string());
            self.queue_byte_budget = DEFAULT_QUEUE_BYTE_BUDGET;
        }

        if self.base_retry_backoff.is_zero() {
            defaulted("base_retry_backoff", "must be greater than 0".to_string());
            self.base_retry_backoff = DEFAULT_BASE_RETRY_BACKOFF;
        }

        if self.max_retry_backoff < self.base_retry_backoff {
            defaulted(
                "max_retry_backoff",
                format!(
                    "{:?} is below base_retry_backoff {:?}",
                    self.max_retry_backoff, self.base_retry_backoff
                ),
            );
            self.max_retry_backoff = DEFAULT_MAX_RETRY_BACKOFF.max(self.base_retry_backoff);
        }

        if self.http_timeout.is_zero() {
            defaulted("http_timeout", "must be greater than 0".to_string());
            self.http_timeout = DEFAULT_HTTP_TIMEOUT;
        }

        if self.drain_timeout.is_zero() {
            defaulted("drain_timeout", "must be greater than 0".to_string());
            self.drain_timeout = DEFAULT_DRAIN_TIMEOUT;
        }

        if self.poll_interval.is_zero() {
            defaulted("poll_interval", "must be greater than 0".to_string());
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }

        reports
    }

    /// Validate the mandatory identity and credential fields.
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("endpoint", &self.endpoint),
            ("access_key_id", &self.access_key_id),
            ("access_key_secret", &self.access_key_secret),
            ("project", &self.project),
            ("logstore", &self.logstore),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(format!("missing required parameters: {}", missing.join(", ")));
        }

        self.endpoint_url()?;

        Ok(())
    }

    /// The endpoint as a URL. A bare host name is taken to mean `https://host`.
    ///
    /// The path always ends in `/` so request paths are appended to it.
    pub fn endpoint_url(&self) -> Result<Url, String> {
        let endpoint = self.endpoint.trim();
        let candidate = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{}", endpoint)
        };

        let mut url = Url::parse(&candidate)
            .map_err(|e| format!("endpoint '{}' is not a valid URI: {}", endpoint, e))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!(
                "endpoint '{}' must use http or https, not {}",
                endpoint,
                url.scheme()
            ));
        }

        if url.host_str().is_none_or(str::is_empty) {
            return Err(format!("endpoint '{}' has no host", endpoint));
        }

        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        Ok(url)
    }

    pub fn thresholds(&self) -> BatchThresholds {
        BatchThresholds {
            max_count: self.batch_count_threshold,
            max_bytes: self.batch_size_threshold_bytes,
            linger: self.linger,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: self.base_retry_backoff,
            max_backoff: self.max_retry_backoff,
            strategy: self.backoff_strategy,
        }
    }
}

fn parse_env<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!("Ignoring {}={}: not a valid number", name, raw),
        }
    }
}

fn parse_millis_env(name: &str, slot: &mut Duration) {
    let mut millis = slot.as_millis() as u64;
    parse_env(name, &mut millis);
    *slot = Duration::from_millis(millis);
}
