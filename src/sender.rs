//! The sender loop: pulls records off the queue, batches them and delivers
//! each batch with retry and backoff

use crate::batch::BatchAccumulator;
use crate::buffer::{Poll, QueueConsumer};
use crate::errors::ForwarderError;
use crate::record::Batch;
use crate::report::{Report, Reporter};
use crate::retry::{RetryPolicy, RetryState};
use crate::state::ForwarderStats;
use crate::transport::{MeteredSink, Sink, TransportMetricsSnapshot};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Final outcome of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Dropped { attempts: u32, reason: String },
}

/// Totals reported by the loop when it exits
#[derive(Debug, Clone, Default)]
pub struct LoopSummary {
    pub delivered_batches: u64,
    pub delivered_records: u64,
    pub dropped_batches: u64,
    pub dropped_records: u64,
    pub transport: TransportMetricsSnapshot,
}

pub struct SenderLoop<S: Sink> {
    consumer: QueueConsumer,
    accumulator: BatchAccumulator,
    sink: MeteredSink<S>,
    policy: RetryPolicy,
    poll_interval: Duration,
    shutdown: CancellationToken,
    abort: CancellationToken,
    stats: Arc<ForwarderStats>,
    reporter: Arc<dyn Reporter>,
    summary: LoopSummary,
}

impl<S: Sink> SenderLoop<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: QueueConsumer,
        accumulator: BatchAccumulator,
        sink: S,
        policy: RetryPolicy,
        poll_interval: Duration,
        shutdown: CancellationToken,
        abort: CancellationToken,
        stats: Arc<ForwarderStats>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            consumer,
            accumulator,
            sink: MeteredSink::new(sink),
            policy,
            poll_interval,
            shutdown,
            abort,
            stats,
            reporter,
            summary: LoopSummary::default(),
        }
    }

    /// Run until shutdown is requested and everything buffered is flushed.
    ///
    /// After shutdown the queue is closed and drained through the same poll
    /// path, so queued records are batched and delivered in order. Cancelling
    /// the abort token instead stops at once: the batch in flight, the open
    /// batch and whatever is still queued are discarded and counted as dropped.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> LoopSummary {
        debug!("Sender loop delivering to {}", self.sink.name());

        let abort = self.abort.clone();
        let aborted = tokio::select! {
            _ = self.pump() => false,
            _ = abort.cancelled() => true,
        };

        if aborted {
            self.discard_remaining();
        }

        self.summary.transport = self.sink.metrics().await;
        info!(
            "Sender loop finished - delivered {} batches ({} records), dropped {} batches ({} records), transport success rate {:.1}%",
            self.summary.delivered_batches,
            self.summary.delivered_records,
            self.summary.dropped_batches,
            self.summary.dropped_records,
            self.summary.transport.success_rate
        );

        self.summary
    }

    async fn pump(&mut self) {
        if let Err(e) = self.sink.probe().await {
            warn!("Sink connectivity check failed, continuing anyway: {}", e);
        }

        let mut draining = false;

        loop {
            if !draining && self.shutdown.is_cancelled() {
                debug!(
                    "Shutdown requested, draining {} queued and {} open records",
                    self.consumer.len(),
                    self.accumulator.len()
                );
                self.consumer.close();
                draining = true;
            }

            let wait = self
                .accumulator
                .time_until_deadline()
                .unwrap_or(self.poll_interval);

            let polled = if draining {
                self.consumer.poll(wait).await
            } else {
                tokio::select! {
                    polled = self.consumer.poll(wait) => polled,
                    _ = self.shutdown.cancelled() => continue,
                }
            };

            match polled {
                Poll::Record(record) => {
                    ForwarderStats::add(&self.stats.in_flight, 1);
                    self.accumulator.add(record);
                }
                Poll::Empty => {}
                Poll::Closed => {
                    self.flush().await;
                    break;
                }
            }

            if self.accumulator.should_flush() {
                self.flush().await;
            }
        }
    }

    /// Drop everything the loop still holds after an abort.
    fn discard_remaining(&mut self) {
        self.consumer.close();
        let queued = self.consumer.drain_all().len() as u64;
        self.accumulator.take_and_reset();

        // in_flight covers the open batch and the one being delivered
        let lost = ForwarderStats::take(&self.stats.in_flight) + queued;

        ForwarderStats::add(&self.stats.dropped_records, lost);
        self.summary.dropped_records += lost;
        warn!("Sender loop aborted, discarded {} undelivered records", lost);
    }

    /// Take the open batch and resolve it.
    ///
    /// Records that cannot be encoded are removed first and reported once
    /// each; they count as dropped and are never retried.
    async fn flush(&mut self) {
        if self.accumulator.is_empty() {
            return;
        }

        let mut batch = self.accumulator.take_and_reset();
        let taken = batch.len() as u64;

        let malformed = batch.remove_malformed();
        if !malformed.is_empty() {
            let skipped = malformed.len() as u64;
            for reason in malformed {
                self.reporter.report(&Report::RecordSkipped { reason });
            }
            ForwarderStats::add(&self.stats.dropped_records, skipped);
            self.summary.dropped_records += skipped;
        }

        if !batch.is_empty() {
            self.resolve(&batch).await;
        }

        ForwarderStats::sub(&self.stats.in_flight, taken);
    }

    async fn resolve(&mut self, batch: &Batch) {
        let records = batch.len() as u64;

        match self.deliver(batch).await {
            DeliveryOutcome::Delivered { attempts } => {
                debug!(
                    "Delivered batch {} with {} records after {} attempts",
                    batch.batch_id, records, attempts
                );
                ForwarderStats::incr(&self.stats.delivered_batches);
                ForwarderStats::add(&self.stats.delivered_records, records);
                self.summary.delivered_batches += 1;
                self.summary.delivered_records += records;
            }
            DeliveryOutcome::Dropped { attempts, reason } => {
                ForwarderStats::incr(&self.stats.dropped_batches);
                ForwarderStats::add(&self.stats.dropped_records, records);
                self.summary.dropped_batches += 1;
                self.summary.dropped_records += records;
                self.reporter.report(&Report::BatchDropped {
                    batch_id: batch.batch_id,
                    records: batch.len(),
                    attempts,
                    reason,
                });
            }
        }
    }

    /// Send `batch`, retrying on failure per the retry policy.
    ///
    /// A shutdown that interrupts a backoff sleep gets one immediate last
    /// attempt; if that fails the batch is given up.
    pub async fn deliver(&self, batch: &Batch) -> DeliveryOutcome {
        let mut retry = RetryState::new();

        loop {
            retry.record_attempt();

            let error = match self.attempt(batch).await {
                Ok(()) => {
                    return DeliveryOutcome::Delivered {
                        attempts: retry.attempts(),
                    };
                }
                Err(e) => e,
            };

            if !error.is_retryable() {
                return DeliveryOutcome::Dropped {
                    attempts: retry.attempts(),
                    reason: error.to_string(),
                };
            }

            retry.record_failure(error);

            if retry.exhausted(&self.policy) {
                return DeliveryOutcome::Dropped {
                    attempts: retry.attempts(),
                    reason: describe_last(retry.last_error()),
                };
            }

            let delay = retry.next_delay(&self.policy);
            warn!(
                "Failed to send batch {} (attempt {}/{}), retrying in {}ms: {}",
                batch.batch_id,
                retry.attempts(),
                self.policy.max_attempts(),
                delay.as_millis(),
                describe_last(retry.last_error())
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    ForwarderStats::incr(&self.stats.retries);
                }
                _ = self.shutdown.cancelled() => {
                    retry.record_attempt();
                    return match self.attempt(batch).await {
                        Ok(()) => DeliveryOutcome::Delivered {
                            attempts: retry.attempts(),
                        },
                        Err(e) => DeliveryOutcome::Dropped {
                            attempts: retry.attempts(),
                            reason: format!("shutdown interrupted retry backoff: {}", e),
                        },
                    };
                }
            }
        }
    }

    /// One send. A panicking sink counts as a failed attempt.
    async fn attempt(&self, batch: &Batch) -> crate::errors::Result<()> {
        match AssertUnwindSafe(self.sink.send(batch)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ForwarderError::Delivery(format!(
                "sink panicked while sending batch {}",
                batch.batch_id
            ))),
        }
    }
}

fn describe_last(error: Option<&ForwarderError>) -> String {
    error
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchThresholds;
    use crate::buffer::record_queue;
    use crate::errors::Result;
    use crate::record::{LogLevel, LogRecord};
    use crate::report::CollectingReporter;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Panics on the first `panics` sends, fails the next `failures`, then
    /// accepts. Every send first waits `delay`.
    #[derive(Default)]
    struct ScriptedSink {
        failures: u32,
        panics: u32,
        delay: Duration,
        attempts: Mutex<Vec<Instant>>,
        delivered: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedSink {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                ..Self::default()
            })
        }

        fn panicking(panics: u32) -> Arc<Self> {
            Arc::new(Self {
                panics,
                ..Self::default()
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }

        fn delivered(&self) -> Vec<Vec<String>> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        async fn send(&self, batch: &Batch) -> Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push(Instant::now());
                attempts.len() as u32
            };

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if attempt <= self.panics {
                panic!("sink blew up on attempt {}", attempt);
            }

            if attempt <= self.panics + self.failures {
                return Err(ForwarderError::Delivery(format!("attempt {} refused", attempt)));
            }

            let messages = batch.records.iter().map(|r| r.message.clone()).collect();
            self.delivered.lock().unwrap().push(messages);
            Ok(())
        }

        fn name(&self) -> String {
            "scripted".to_string()
        }
    }

    struct Harness {
        sink: Arc<ScriptedSink>,
        reporter: CollectingReporter,
        stats: Arc<ForwarderStats>,
        shutdown: CancellationToken,
        abort: CancellationToken,
    }

    fn sender(
        sink: Arc<ScriptedSink>,
        thresholds: BatchThresholds,
        policy: RetryPolicy,
    ) -> (SenderLoop<Arc<ScriptedSink>>, crate::buffer::RecordQueue, Harness) {
        let (queue, consumer) = record_queue(128, usize::MAX);
        let reporter = CollectingReporter::new();
        let stats = Arc::new(ForwarderStats::default());
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();

        let sender = SenderLoop::new(
            consumer,
            BatchAccumulator::new(thresholds),
            Arc::clone(&sink),
            policy,
            Duration::from_millis(20),
            shutdown.clone(),
            abort.clone(),
            Arc::clone(&stats),
            Arc::new(reporter.clone()),
        );

        (
            sender,
            queue,
            Harness {
                sink,
                reporter,
                stats,
                shutdown,
                abort,
            },
        )
    }

    fn policy(max_retries: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_millis(base_ms),
            max_backoff: Duration::from_secs(5),
            ..RetryPolicy::default()
        }
    }

    fn thresholds(max_count: usize, linger_ms: u64) -> BatchThresholds {
        BatchThresholds {
            max_count,
            max_bytes: usize::MAX,
            linger: Duration::from_millis(linger_ms),
        }
    }

    fn record(i: usize) -> LogRecord {
        LogRecord::new(LogLevel::Info, "test", format!("m{}", i))
    }

    #[tokio::test]
    async fn test_retry_until_success_with_linear_backoff() {
        let sink = ScriptedSink::failing(2);
        let (sender, _queue, h) = sender(sink, thresholds(10, 1000), policy(3, 50));
        let batch = Batch::from_records(vec![record(1)]);

        let outcome = sender.deliver(&batch).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });

        let attempts = h.sink.attempts();
        assert_eq!(attempts.len(), 3);
        assert!(attempts[1] - attempts[0] >= Duration::from_millis(50));
        assert!(attempts[2] - attempts[1] >= Duration::from_millis(100));
        assert_eq!(h.stats.retries.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_panicking_sink_is_retried() {
        let sink = ScriptedSink::panicking(1);
        let (sender, _queue, h) = sender(sink, thresholds(10, 1000), policy(3, 5));
        let batch = Batch::from_records(vec![record(1)]);

        let outcome = sender.deliver(&batch).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 2 });
        assert_eq!(h.sink.delivered(), vec![vec!["m1"]]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_batch() {
        let sink = ScriptedSink::failing(u32::MAX);
        let (sender, _queue, h) = sender(sink, thresholds(10, 1000), policy(3, 5));
        let batch = Batch::from_records(vec![record(1), record(2)]);

        match sender.deliver(&batch).await {
            DeliveryOutcome::Dropped { attempts, reason } => {
                assert_eq!(attempts, 4);
                assert!(reason.contains("attempt 4 refused"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.sink.attempts().len(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_makes_one_last_attempt() {
        let sink = ScriptedSink::failing(u32::MAX);
        let (sender, _queue, h) = sender(sink, thresholds(10, 1000), policy(10, 10_000));
        let batch = Batch::from_records(vec![record(1)]);

        let shutdown = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        });

        let started = Instant::now();
        match sender.deliver(&batch).await {
            DeliveryOutcome::Dropped { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("shutdown interrupted"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_count_threshold_flushes_one_batch() {
        let sink = ScriptedSink::failing(0);
        let (sender, queue, h) = sender(sink, thresholds(5, 60_000), policy(0, 10));
        let handle = tokio::spawn(sender.run());

        for i in 0..5 {
            assert!(queue.enqueue(record(i)));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.sink.delivered(), vec![vec!["m0", "m1", "m2", "m3", "m4"]]);

        h.shutdown.cancel();
        let summary = handle.await.unwrap();
        assert_eq!(summary.delivered_batches, 1);
        assert_eq!(summary.delivered_records, 5);
    }

    #[tokio::test]
    async fn test_linger_flushes_single_record() {
        let sink = ScriptedSink::failing(0);
        let (sender, queue, h) = sender(sink, thresholds(1000, 100), policy(0, 10));
        let handle = tokio::spawn(sender.run());

        assert!(queue.enqueue(record(1)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.sink.delivered().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.sink.delivered(), vec![vec!["m1"]]);

        h.shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(h.sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_failure_drops_once_and_keeps_going() {
        let sink = ScriptedSink::failing(4);
        let (sender, queue, h) = sender(sink, thresholds(2, 60_000), policy(3, 5));
        let handle = tokio::spawn(sender.run());

        queue.enqueue(record(1));
        queue.enqueue(record(2));
        tokio::time::sleep(Duration::from_millis(200)).await;

        queue.enqueue(record(3));
        queue.enqueue(record(4));
        tokio::time::sleep(Duration::from_millis(200)).await;

        h.shutdown.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(summary.dropped_batches, 1);
        assert_eq!(summary.delivered_batches, 1);
        assert_eq!(h.sink.delivered(), vec![vec!["m3", "m4"]]);
        assert_eq!(
            h.reporter
                .count(|r| matches!(r, Report::BatchDropped { records: 2, .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_and_open_batch() {
        let sink = ScriptedSink::failing(0);
        let (sender, queue, h) = sender(sink, thresholds(3, 60_000), policy(0, 10));

        for i in 0..7 {
            assert!(queue.enqueue(record(i)));
        }
        h.shutdown.cancel();

        let summary = sender.run().await;
        assert_eq!(summary.delivered_records, 7);

        let delivered: Vec<String> = h.sink.delivered().into_iter().flatten().collect();
        let expected: Vec<String> = (0..7).map(|i| format!("m{}", i)).collect();
        assert_eq!(delivered, expected);
        assert_eq!(h.stats.in_flight.load(std::sync::atomic::Ordering::Relaxed), 0);
        assert!(!queue.enqueue(record(99)));
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped_once_across_retries() {
        let sink = ScriptedSink::failing(2);
        let (sender, queue, h) = sender(sink, thresholds(2, 60_000), policy(3, 5));
        let handle = tokio::spawn(sender.run());

        assert!(queue.enqueue(LogRecord::new(LogLevel::Info, "test", "good")));
        assert!(queue.enqueue(LogRecord::new(LogLevel::Info, "test", "bad\0")));
        tokio::time::sleep(Duration::from_millis(200)).await;

        h.shutdown.cancel();
        let summary = handle.await.unwrap();

        assert_eq!(h.sink.attempts().len(), 3);
        assert_eq!(h.sink.delivered(), vec![vec!["good"]]);
        assert_eq!(
            h.reporter
                .count(|r| matches!(r, Report::RecordSkipped { .. })),
            1
        );
        assert_eq!(summary.delivered_records, 1);
        assert_eq!(summary.dropped_records, 1);
        assert_eq!(summary.dropped_batches, 0);
        assert_eq!(h.stats.in_flight.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_batch_of_only_malformed_records_is_not_sent() {
        let sink = ScriptedSink::failing(0);
        let (sender, queue, h) = sender(sink, thresholds(1, 60_000), policy(0, 5));

        assert!(queue.enqueue(LogRecord::new(LogLevel::Info, "test", "\0")));
        h.shutdown.cancel();

        let summary = sender.run().await;
        assert!(h.sink.attempts().is_empty());
        assert_eq!(summary.dropped_records, 1);
        assert_eq!(summary.delivered_batches, 0);
    }

    #[tokio::test]
    async fn test_abort_discards_in_flight_and_queued_records() {
        let sink = ScriptedSink::slow(Duration::from_secs(30));
        let (sender, queue, h) = sender(sink, thresholds(3, 60_000), policy(0, 5));
        let handle = tokio::spawn(sender.run());

        for i in 0..5 {
            assert!(queue.enqueue(record(i)));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.sink.attempts().len(), 1);

        h.shutdown.cancel();
        h.abort.cancel();

        let started = Instant::now();
        let summary = handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(h.sink.delivered().is_empty());
        assert_eq!(summary.delivered_records, 0);
        assert_eq!(summary.dropped_records, 5);
        assert_eq!(h.stats.dropped_records.load(std::sync::atomic::Ordering::Relaxed), 5);
        assert_eq!(h.stats.in_flight.load(std::sync::atomic::Ordering::Relaxed), 0);
        assert_eq!(queue.bytes(), 0);
        assert!(!queue.enqueue(record(99)));
    }
}
