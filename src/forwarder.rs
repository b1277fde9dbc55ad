//! Lifecycle controller: owns the queue, the sink and the sender thread

use crate::batch::BatchAccumulator;
use crate::buffer::{RecordQueue, record_queue};
use crate::config::Config;
use crate::errors::{ForwarderError, Result};
use crate::record::LogRecord;
use crate::report::{Report, Reporter, TracingReporter};
use crate::sender::{LoopSummary, SenderLoop};
use crate::state::{ForwarderStats, RunState, StateCell, StatsSnapshot};
use crate::transport::{HttpSink, Sink};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) const SENDER_THREAD_NAME: &str = "log-forwarder-sender";

/// How long `stop` waits for an aborted sender thread to exit.
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Builds the sink when the forwarder starts.
pub type SinkFactory =
    Box<dyn Fn(&Config, Arc<dyn Reporter>) -> Result<Arc<dyn Sink>> + Send + Sync>;

/// The sender thread of one start/stop cycle
struct Worker {
    shutdown: CancellationToken,
    abort: CancellationToken,
    done: mpsc::Receiver<LoopSummary>,
    handle: JoinHandle<()>,
    drain_timeout: Duration,
}

/// Asynchronous log forwarder.
///
/// `append` never blocks and never fails loudly: records are queued for the
/// sender thread, or dropped and reported when the forwarder is not running
/// or the queue is full.
pub struct LogForwarder {
    config: Config,
    sink_factory: SinkFactory,
    reporter: Arc<dyn Reporter>,
    state: StateCell,
    stats: Arc<ForwarderStats>,
    queue: RwLock<Option<RecordQueue>>,
    worker: Mutex<Option<Worker>>,
    /// Aborted sender thread that was still stuck in the sink when `stop` returned
    lingering: Mutex<Option<JoinHandle<()>>>,
}

impl LogForwarder {
    /// Create a stopped forwarder that will deliver through the sink built by `sink_factory`.
    pub fn new<F>(config: Config, sink_factory: F) -> Self
    where
        F: Fn(&Config, Arc<dyn Reporter>) -> Result<Arc<dyn Sink>> + Send + Sync + 'static,
    {
        Self {
            config,
            sink_factory: Box::new(sink_factory),
            reporter: Arc::new(TracingReporter),
            state: StateCell::default(),
            stats: Arc::new(ForwarderStats::default()),
            queue: RwLock::new(None),
            worker: Mutex::new(None),
            lingering: Mutex::new(None),
        }
    }

    /// Create a stopped forwarder delivering to the HTTP ingestion endpoint
    pub fn http(config: Config) -> Self {
        Self::new(config, |config, reporter| {
            let sink: Arc<dyn Sink> = Arc::new(HttpSink::new(config, reporter)?);
            Ok(sink)
        })
    }

    /// Send reports to `reporter` instead of the tracing log.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let queued = read(&self.queue).as_ref().map_or(0, RecordQueue::len);
        self.stats.snapshot(queued)
    }

    /// Validate the configuration and spin up the sender thread.
    ///
    /// Calling this while not stopped is ignored with a warning, as is calling
    /// it while the sender thread of an aborted run has not exited yet. On a
    /// configuration or runtime error the forwarder stays stopped.
    pub fn start(&self) -> Result<()> {
        if let Err(state) = self.state.transition(RunState::Stopped, RunState::Starting) {
            self.reporter.report(&Report::IgnoredLifecycleCall {
                call: "start",
                state: state.to_string(),
            });
            return Ok(());
        }

        if !self.reap_previous_sender() {
            self.state.set(RunState::Stopped);
            self.reporter.report(&Report::IgnoredLifecycleCall {
                call: "start",
                state: "stopped, previous sender thread still running".to_string(),
            });
            return Ok(());
        }

        match self.spawn_worker() {
            Ok(sink) => {
                self.state.set(RunState::Running);
                self.reporter.report(&Report::Started { sink });
                Ok(())
            }
            Err(e) => {
                if let ForwarderError::Config(msg) = &e {
                    self.reporter.report(&Report::ConfigurationError(msg.clone()));
                } else {
                    error!("Failed to start log forwarder: {}", e);
                }
                self.state.set(RunState::Stopped);
                Err(e)
            }
        }
    }

    /// Join the sender thread left behind by an aborted stop. Returns false
    /// while that thread is still running.
    fn reap_previous_sender(&self) -> bool {
        let mut lingering = lock(&self.lingering);
        match lingering.take() {
            Some(handle) if !handle.is_finished() => {
                *lingering = Some(handle);
                false
            }
            Some(handle) => {
                if handle.join().is_err() {
                    error!("Aborted sender thread panicked");
                }
                true
            }
            None => true,
        }
    }

    fn spawn_worker(&self) -> Result<String> {
        let mut config = self.config.clone();
        for report in config.sanitize() {
            self.reporter.report(&report);
        }
        config.validate().map_err(ForwarderError::Config)?;

        let sink = (self.sink_factory)(&config, Arc::clone(&self.reporter))?;
        let sink_name = sink.name();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ForwarderError::Runtime(format!("failed to build runtime: {}", e)))?;

        let (queue, consumer) = record_queue(config.queue_capacity, config.queue_byte_budget);
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let sender = SenderLoop::new(
            consumer,
            BatchAccumulator::new(config.thresholds()),
            sink,
            config.retry_policy(),
            config.poll_interval,
            shutdown.clone(),
            abort.clone(),
            Arc::clone(&self.stats),
            Arc::clone(&self.reporter),
        );

        let (done_tx, done) = mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name(SENDER_THREAD_NAME.to_string())
            .spawn(move || {
                let summary = runtime.block_on(sender.run());
                let _ = done_tx.send(summary);
            })
            .map_err(|e| ForwarderError::Runtime(format!("failed to spawn sender thread: {}", e)))?;

        debug!(
            "Sender thread started - queue capacity {} ({} bytes), batch count {}, linger {:?}",
            config.queue_capacity,
            config.queue_byte_budget,
            config.batch_count_threshold,
            config.linger
        );

        *write(&self.queue) = Some(queue);
        *lock(&self.worker) = Some(Worker {
            shutdown,
            abort,
            done,
            handle,
            drain_timeout: config.drain_timeout,
        });

        Ok(sink_name)
    }

    /// Offer a record for delivery. Returns whether it was queued.
    pub fn append(&self, record: LogRecord) -> bool {
        if self.state.get() != RunState::Running {
            self.reject_not_running();
            return false;
        }

        let accepted = read(&self.queue)
            .as_ref()
            .is_some_and(|queue| queue.enqueue(record));

        if accepted {
            ForwarderStats::incr(&self.stats.enqueued);
        } else if self.state.get() == RunState::Running {
            let dropped_total = ForwarderStats::incr(&self.stats.dropped_overflow);
            self.reporter.report(&Report::QueueOverflow { dropped_total });
        } else {
            self.reject_not_running();
        }

        accepted
    }

    fn reject_not_running(&self) {
        let dropped_total = ForwarderStats::incr(&self.stats.dropped_not_running);
        self.reporter.report(&Report::NotRunning { dropped_total });
    }

    /// Drain the queue and the open batch, then stop the sender thread.
    ///
    /// Waits at most `drain_timeout`. After that whatever is still unflushed
    /// is reported as lost and the sender is aborted, so none of it is
    /// delivered later. Calling this while not running is ignored with a
    /// warning.
    pub fn stop(&self) {
        if let Err(state) = self.state.transition(RunState::Running, RunState::Draining) {
            self.reporter.report(&Report::IgnoredLifecycleCall {
                call: "stop",
                state: state.to_string(),
            });
            return;
        }

        info!("Stopping log forwarder, draining queued records");

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.shutdown.cancel();
            match worker.done.recv_timeout(worker.drain_timeout) {
                Ok(summary) => {
                    debug!(
                        "Sender loop drained - {} transport attempts, avg {}ms",
                        summary.transport.attempts, summary.transport.avg_duration_ms
                    );
                    if worker.handle.join().is_err() {
                        error!("Sender thread panicked during shutdown");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    let unflushed = self.stats().unflushed();
                    self.reporter.report(&Report::ShutdownTimeout { unflushed });
                    self.abort_worker(worker);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Sender thread exited without reporting a summary");
                }
            }
        }

        *write(&self.queue) = None;
        self.state.set(RunState::Stopped);

        let stats = self.stats.snapshot(0);
        self.reporter.report(&Report::Stopped {
            delivered_records: stats.delivered_records,
            dropped_records: stats.dropped_records
                + stats.dropped_overflow
                + stats.dropped_not_running,
        });
    }

    /// Abort a sender that missed its drain deadline.
    ///
    /// A sink blocking its thread cannot be interrupted; such a thread is
    /// kept aside and `start` refuses to run until it has exited.
    fn abort_worker(&self, worker: Worker) {
        worker.abort.cancel();

        match worker.done.recv_timeout(ABORT_GRACE) {
            Ok(summary) => {
                debug!(
                    "Sender loop aborted - {} records dropped in total",
                    summary.dropped_records
                );
                if worker.handle.join().is_err() {
                    error!("Sender thread panicked during abort");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Sender thread is blocked in the sink and did not exit after abort");
                *lock(&self.lingering) = Some(worker.handle);
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Sender thread exited without reporting a summary");
            }
        }
    }
}

impl Drop for LogForwarder {
    fn drop(&mut self) {
        if self.state.get() == RunState::Running {
            self.stop();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
