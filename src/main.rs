//! Log Forwarder Binary
//!
//! Reads lines from stdin and forwards each one as a log record.

use clap::Parser;
use log_forwarder::{Config, LogForwarder, LogLevel, LogRecord, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "log-forwarder", version, about = "Forward stdin lines to a log ingestion service")]
struct Args {
    /// Base URI of the ingestion service
    #[arg(long, env = "LOG_FORWARDER_ENDPOINT")]
    endpoint: Option<String>,

    /// Destination project
    #[arg(long, env = "LOG_FORWARDER_PROJECT")]
    project: Option<String>,

    /// Destination logstore
    #[arg(long, env = "LOG_FORWARDER_LOGSTORE")]
    logstore: Option<String>,

    /// Logger name attached to every forwarded line
    #[arg(long, default_value = "stdin")]
    logger: String,

    /// Level attached to every forwarded line
    #[arg(long, default_value = "info")]
    level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let args = Args::parse();
    info!("Starting log forwarder v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env();
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(project) = args.project {
        config.project = project;
    }
    if let Some(logstore) = args.logstore {
        config.logstore = logstore;
    }

    info!(
        "Forwarder configuration - Endpoint: {}, Project: {}, Logstore: {}, Compression: {}",
        config.endpoint, config.project, config.logstore, config.compression
    );

    let forwarder = LogForwarder::http(config);
    if let Err(e) = forwarder.start() {
        error!("Forwarder failed to start: {}", e);
        std::process::exit(1);
    }

    let level = LogLevel::from(args.level.as_str());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    forwarder.append(LogRecord::new(level, args.logger.as_str(), line));
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    // stop() blocks on the sender thread
    let forwarder = tokio::task::spawn_blocking(move || {
        forwarder.stop();
        forwarder
    })
    .await
    .map_err(|e| log_forwarder::ForwarderError::Runtime(format!("shutdown task failed: {}", e)))?;

    let stats = forwarder.stats();
    info!(
        "Final forwarder stats - Enqueued: {}, Delivered: {} records in {} batches, Dropped: {} records ({} on overflow), Retries: {}",
        stats.enqueued,
        stats.delivered_records,
        stats.delivered_batches,
        stats.dropped_records + stats.dropped_overflow + stats.dropped_not_running,
        stats.dropped_overflow,
        stats.retries
    );

    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
