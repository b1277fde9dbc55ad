//! Sink capability and the HTTP transport to the ingestion service

use crate::config::Config;
use crate::encoding::BatchEncoder;
use crate::errors::{ForwarderError, Result};
use crate::record::Batch;
use crate::report::{Report, Reporter};
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Response, Url};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info};

const API_VERSION: &str = "0.6.0";

/// Transmits one batch to the destination.
///
/// `Ok(())` means the destination accepted the batch. Any error is treated
/// as a delivery failure and retried by the sender loop; implementations
/// should not retry on their own.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, batch: &Batch) -> Result<()>;

    /// Cheap reachability check run once when the sender loop starts.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    /// Human readable destination, used in reports.
    fn name(&self) -> String;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Arc<S> {
    async fn send(&self, batch: &Batch) -> Result<()> {
        (**self).send(batch).await
    }

    async fn probe(&self) -> Result<()> {
        (**self).probe().await
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// HTTP sink posting encoded batches to a project/logstore pair
pub struct HttpSink {
    client: Client,
    url: Url,
    health_url: Url,
    project: String,
    access_key_id: String,
    access_key_secret: String,
    encoder: BatchEncoder,
    timeout: Duration,
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for HttpSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSink")
            .field("url", &self.url.as_str())
            .field("project", &self.project)
            .field("compression", &self.encoder.compression())
            .finish()
    }
}

impl HttpSink {
    /// Create a new HTTP sink from a validated configuration
    pub fn new(config: &Config, reporter: Arc<dyn Reporter>) -> Result<Self> {
        let base = config.endpoint_url().map_err(ForwarderError::Config)?;
        let url = base
            .join(&format!("logstores/{}/shards/lb", config.logstore.trim()))
            .map_err(|e| ForwarderError::Config(format!("invalid logstore path: {}", e)))?;
        let health_url = base
            .join("health")
            .map_err(|e| ForwarderError::Config(format!("invalid health path: {}", e)))?;

        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(format!("log_forwarder/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ForwarderError::Http)?;

        Ok(Self {
            client,
            url,
            health_url,
            project: config.project.trim().to_string(),
            access_key_id: config.access_key_id.clone(),
            access_key_secret: config.access_key_secret.clone(),
            encoder: BatchEncoder::new(
                config.topic.clone(),
                config.source.clone(),
                config.compression,
            ),
            timeout: config.http_timeout,
            reporter,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn headers(&self, raw_size: usize) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-log-apiversion", HeaderValue::from_static(API_VERSION));
        headers.insert("x-log-bodyrawsize", HeaderValue::from(raw_size));

        if let Ok(project) = HeaderValue::from_str(&self.project) {
            headers.insert("x-log-project", project);
        }

        if let Some(compression) = self.encoder.compression().header_value() {
            headers.insert("x-log-compresstype", HeaderValue::from_static(compression));
        }

        headers
    }

    /// Map the ingestion service response onto a delivery result
    async fn handle_response(&self, response: Response, batch: &Batch) -> Result<()> {
        let status = response.status();
        let batch_id = batch.batch_id;

        if status.is_success() {
            debug!("Batch {} accepted by {}", batch_id, self.url);
            return Ok(());
        }

        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let error_message = match status.as_u16() {
            400 => format!("Bad request for batch {}: {}", batch_id, error_body),
            401 => format!("Unauthorized for batch {}: {}", batch_id, error_body),
            403 => format!("Forbidden for batch {}: {}", batch_id, error_body),
            404 => format!("Logstore not found for batch {}: {}", batch_id, error_body),
            413 => format!("Batch {} too large: {}", batch_id, error_body),
            429 => format!("Rate limited for batch {}: {}", batch_id, error_body),
            500..=599 => format!("Server error for batch {}: {}", batch_id, error_body),
            _ => format!(
                "Unexpected response {} for batch {}: {}",
                status, batch_id, error_body
            ),
        };

        Err(ForwarderError::Delivery(error_message))
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&self, batch: &Batch) -> Result<()> {
        let payload = self.encoder.encode(batch)?;

        // the sender loop strips malformed records before sending, so this
        // only fires for callers driving the sink directly
        for reason in &payload.skipped {
            self.reporter.report(&Report::RecordSkipped {
                reason: reason.clone(),
            });
        }

        debug!(
            "Sending batch {} with {} records ({} bytes, {} raw) to {}",
            batch.batch_id,
            payload.records,
            payload.body.len(),
            payload.raw_size,
            self.url
        );

        let request = self
            .client
            .post(self.url.clone())
            .headers(self.headers(payload.raw_size))
            .basic_auth(&self.access_key_id, Some(&self.access_key_secret))
            .body(payload.body);

        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| ForwarderError::Delivery("Request timeout".to_string()))?
            .map_err(ForwarderError::Http)?;

        self.handle_response(response, batch).await
    }

    async fn probe(&self) -> Result<()> {
        debug!("Performing health check against {}", self.health_url);

        let response = timeout(self.timeout, self.client.get(self.health_url.clone()).send())
            .await
            .map_err(|_| ForwarderError::Delivery("Health check timeout".to_string()))?
            .map_err(ForwarderError::Http)?;

        if !response.status().is_success() {
            return Err(ForwarderError::Delivery(format!(
                "Health check failed with status: {}",
                response.status()
            )));
        }

        info!("Ingestion endpoint {} is reachable", self.health_url);
        Ok(())
    }

    fn name(&self) -> String {
        format!("{} ({})", self.url, self.project)
    }
}

/// Sink wrapper that tracks attempts, outcomes and latency
pub struct MeteredSink<S> {
    inner: S,
    metrics: TransportMetrics,
}

impl<S: Sink> MeteredSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            metrics: TransportMetrics::new(),
        }
    }

    /// Get transport metrics
    pub async fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: Sink> Sink for MeteredSink<S> {
    async fn send(&self, batch: &Batch) -> Result<()> {
        let start_time = Instant::now();
        self.metrics.increment_attempts().await;

        match self.inner.send(batch).await {
            Ok(()) => {
                self.metrics.record_success(start_time.elapsed()).await;
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failure(start_time.elapsed()).await;
                Err(e)
            }
        }
    }

    async fn probe(&self) -> Result<()> {
        self.inner.probe().await
    }

    fn name(&self) -> String {
        self.inner.name()
    }
}

/// Transport metrics tracking
#[derive(Debug)]
struct TransportMetrics {
    inner: RwLock<MetricsState>,
}

#[derive(Debug, Default)]
struct MetricsState {
    attempts: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
}

impl TransportMetrics {
    fn new() -> Self {
        Self {
            inner: RwLock::new(MetricsState::default()),
        }
    }

    async fn increment_attempts(&self) {
        self.inner.write().await.attempts += 1;
    }

    async fn record_success(&self, duration: Duration) {
        let mut state = self.inner.write().await;
        state.successes += 1;
        state.update_duration(duration);
    }

    async fn record_failure(&self, duration: Duration) {
        let mut state = self.inner.write().await;
        state.failures += 1;
        state.update_duration(duration);
    }

    async fn snapshot(&self) -> TransportMetricsSnapshot {
        let state = self.inner.read().await;

        let success_rate = if state.attempts > 0 {
            (state.successes as f64 / state.attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration = if state.attempts > 0 {
            state.total_duration / state.attempts as u32
        } else {
            Duration::ZERO
        };

        TransportMetricsSnapshot {
            attempts: state.attempts,
            successes: state.successes,
            failures: state.failures,
            success_rate,
            avg_duration_ms: avg_duration.as_millis() as u64,
            min_duration_ms: state.min_duration.map(|d| d.as_millis() as u64),
            max_duration_ms: state.max_duration.map(|d| d.as_millis() as u64),
        }
    }
}

impl MetricsState {
    fn update_duration(&mut self, duration: Duration) {
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |m| m.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |m| m.max(duration)));
    }
}

/// Snapshot of transport metrics
#[derive(Debug, Clone, Default)]
pub struct TransportMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogLevel, LogRecord};
    use crate::report::CollectingReporter;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(endpoint: &str) -> Config {
        Config {
            endpoint: endpoint.to_string(),
            access_key_id: "id".to_string(),
            access_key_secret: "secret".to_string(),
            project: "shop".to_string(),
            logstore: "orders".to_string(),
            ..Config::default()
        }
    }

    struct FlakySink {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn send(&self, _batch: &Batch) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Err(ForwarderError::Delivery("flaky".to_string()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn test_sink_url_from_config() {
        let sink = HttpSink::new(
            &config("http://localhost:8080"),
            Arc::new(CollectingReporter::new()),
        )
        .unwrap();

        assert_eq!(
            sink.url().as_str(),
            "http://localhost:8080/logstores/orders/shards/lb"
        );
        assert!(sink.name().contains("shop"));
    }

    #[test]
    fn test_sink_url_keeps_endpoint_path() {
        let sink = HttpSink::new(
            &config("http://gateway.internal/api"),
            Arc::new(CollectingReporter::new()),
        )
        .unwrap();

        assert_eq!(
            sink.url().as_str(),
            "http://gateway.internal/api/logstores/orders/shards/lb"
        );
        assert_eq!(sink.health_url.as_str(), "http://gateway.internal/api/health");
    }

    #[test]
    fn test_headers_carry_size_and_compression() {
        let mut cfg = config("http://localhost:8080");
        cfg.compression = crate::encoding::CompressionMode::Gzip;
        let sink = HttpSink::new(&cfg, Arc::new(CollectingReporter::new())).unwrap();

        let headers = sink.headers(1234);
        assert_eq!(headers["x-log-bodyrawsize"], "1234");
        assert_eq!(headers["x-log-compresstype"], "gzip");
        assert_eq!(headers["x-log-project"], "shop");
    }

    #[tokio::test]
    async fn test_metered_sink_counts_outcomes() {
        let sink = MeteredSink::new(FlakySink {
            calls: AtomicU32::new(0),
        });
        let batch = Batch::from_records(vec![LogRecord::new(LogLevel::Info, "t", "m")]);

        assert!(sink.send(&batch).await.is_err());
        assert!(sink.send(&batch).await.is_ok());
        assert!(sink.send(&batch).await.is_err());

        let metrics = sink.metrics().await;
        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 2);
        assert!(metrics.min_duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_empty_metrics() {
        let sink = MeteredSink::new(FlakySink {
            calls: AtomicU32::new(0),
        });

        let metrics = sink.metrics().await;
        assert_eq!(metrics.attempts, 0);
        assert_eq!(metrics.success_rate, 0.0);
    }
}
