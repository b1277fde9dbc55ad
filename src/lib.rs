//! Asynchronous Log Forwarder Library
//!
//! This library takes log records from application threads without blocking
//! them, batches the records in the background and delivers each batch to a
//! remote ingestion service with retry and backoff.

pub mod batch;
pub mod buffer;
pub mod config;
pub mod encoding;
pub mod errors;
pub mod forwarder;
pub mod layer;
pub mod record;
pub mod report;
pub mod retry;
pub mod sender;
pub mod state;
pub mod transport;

pub use config::Config;
pub use errors::{ForwarderError, Result};
pub use forwarder::LogForwarder;
pub use layer::ForwarderLayer;
pub use record::{Batch, LogLevel, LogRecord};
pub use report::{CollectingReporter, Report, Reporter, TracingReporter};
pub use state::{RunState, StatsSnapshot};
pub use transport::{HttpSink, Sink};
