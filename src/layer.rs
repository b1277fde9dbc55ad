//! `tracing` integration: forwards events from the host's subscriber

use crate::forwarder::{LogForwarder, SENDER_THREAD_NAME};
use crate::record::{LogLevel, LogRecord};
use std::fmt::Write;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Events from these targets are never forwarded, so the forwarder's own
/// diagnostics cannot feed back into it.
const IGNORED_TARGET_PREFIX: &str = "log_forwarder";

/// A tracing layer that turns each event into a [`LogRecord`] and appends it
/// to a [`LogForwarder`]
pub struct ForwarderLayer {
    forwarder: Arc<LogForwarder>,
}

impl ForwarderLayer {
    #[must_use]
    pub const fn new(forwarder: Arc<LogForwarder>) -> Self {
        Self { forwarder }
    }
}

/// Collects the `message` field and every other field as context
#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.clear();
            write!(self.message, "{value:?}").ok();
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.fields.push((field.name().to_string(), value.to_string()));
    }
}

impl<S> Layer<S> for ForwarderLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(IGNORED_TARGET_PREFIX) {
            return;
        }

        // Anything logged on the sender thread (HTTP client internals) stays local
        if std::thread::current().name() == Some(SENDER_THREAD_NAME) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        if visitor.message.is_empty() {
            visitor.message = metadata.name().to_string();
        }

        let mut record = LogRecord::new(
            LogLevel::from(*metadata.level()),
            metadata.target(),
            visitor.message,
        );
        for (key, value) in visitor.fields {
            if key == "error" {
                record = record.with_throwable(value);
            } else {
                record = record.with_context(key, value);
            }
        }

        self.forwarder.append(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::errors::Result;
    use crate::record::Batch;
    use crate::transport::Sink;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<LogRecord>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn send(&self, batch: &Batch) -> Result<()> {
            self.records.lock().unwrap().extend(batch.records.iter().cloned());
            Ok(())
        }

        fn name(&self) -> String {
            "recording".to_string()
        }
    }

    #[test]
    fn test_events_become_records() {
        let sink = Arc::new(RecordingSink::default());
        let factory_sink = Arc::clone(&sink);
        let config = Config {
            endpoint: "http://localhost:9".to_string(),
            access_key_id: "id".to_string(),
            access_key_secret: "secret".to_string(),
            project: "shop".to_string(),
            logstore: "orders".to_string(),
            poll_interval: Duration::from_millis(20),
            ..Config::default()
        };
        let forwarder = Arc::new(LogForwarder::new(config, move |_, _| {
            let sink: Arc<dyn Sink> = factory_sink.clone();
            Ok(sink)
        }));
        forwarder.start().unwrap();

        let subscriber =
            tracing_subscriber::registry().with(ForwarderLayer::new(Arc::clone(&forwarder)));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "checkout", order_id = 42, "payment declined");
            tracing::info!(target: "log_forwarder::sender", "internal");
        });

        forwarder.stop();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Warn);
        assert_eq!(records[0].logger, "checkout");
        assert_eq!(records[0].message, "payment declined");
        assert_eq!(records[0].context.get("order_id").map(String::as_str), Some("42"));
    }
}
