//! Wire encodings for batches sent to the ingestion service
//!
//! Every encoding shares the same JSON document:
//!
//! ```text
//! {"__topic__": "..", "__source__": "..", "__logs__": [{"__time__": "..", "level": "..", ..}]}
//! ```
//!
//! and differs only in how the body is compressed.

use crate::errors::{ForwarderError, Result};
use crate::record::{Batch, LogRecord};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl CompressionMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "none" | "plain" => Some(CompressionMode::None),
            "gzip" | "gz" => Some(CompressionMode::Gzip),
            "zstd" => Some(CompressionMode::Zstd),
            _ => None,
        }
    }

    /// Value of the `x-log-compresstype` header, if any.
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            CompressionMode::None => None,
            CompressionMode::Gzip => Some("gzip"),
            CompressionMode::Zstd => Some("zstd"),
        }
    }
}

impl std::fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionMode::None => write!(f, "none"),
            CompressionMode::Gzip => write!(f, "gzip"),
            CompressionMode::Zstd => write!(f, "zstd"),
        }
    }
}

/// A batch ready to put on the wire.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub body: Vec<u8>,
    /// Length of the uncompressed JSON document
    pub raw_size: usize,
    /// Records that made it into the body
    pub records: usize,
    /// Per-record encoding failures that were skipped
    pub skipped: Vec<String>,
    pub compression: CompressionMode,
}

/// Encodes batches for one destination topic/source pair.
#[derive(Debug, Clone)]
pub struct BatchEncoder {
    topic: String,
    source: String,
    compression: CompressionMode,
}

impl BatchEncoder {
    pub fn new(topic: String, source: String, compression: CompressionMode) -> Self {
        Self {
            topic,
            source,
            compression,
        }
    }

    pub fn compression(&self) -> CompressionMode {
        self.compression
    }

    /// Encode `batch`. Records that fail to encode are left out and listed in
    /// [`EncodedPayload::skipped`]; the batch as a whole only fails when
    /// nothing could be encoded or compression itself fails.
    pub fn encode(&self, batch: &Batch) -> Result<EncodedPayload> {
        let mut logs = Vec::with_capacity(batch.len());
        let mut skipped = Vec::new();

        for record in &batch.records {
            match encode_record(record) {
                Ok(item) => logs.push(item),
                Err(e) => skipped.push(e.to_string()),
            }
        }

        if logs.is_empty() && !batch.is_empty() {
            return Err(ForwarderError::Encoding(format!(
                "none of the {} records in batch {} could be encoded",
                batch.len(),
                batch.batch_id
            )));
        }

        let records = logs.len();
        let mut document = Map::new();
        document.insert("__topic__".to_string(), Value::String(self.topic.clone()));
        document.insert("__source__".to_string(), Value::String(self.source.clone()));
        document.insert("__logs__".to_string(), Value::Array(logs));

        let raw = serde_json::to_vec(&Value::Object(document))?;
        let raw_size = raw.len();
        let body = compress(self.compression, raw)?;

        Ok(EncodedPayload {
            body,
            raw_size,
            records,
            skipped,
            compression: self.compression,
        })
    }
}

fn encode_record(record: &LogRecord) -> Result<Value> {
    let mut item = Map::new();
    item.insert(
        "__time__".to_string(),
        Value::String(record.unix_time().to_string()),
    );

    record.validate().map_err(ForwarderError::Encoding)?;

    for (key, value) in record.fields() {
        item.insert(key, Value::String(value));
    }

    Ok(Value::Object(item))
}

fn compress(mode: CompressionMode, raw: Vec<u8>) -> Result<Vec<u8>> {
    match mode {
        CompressionMode::None => Ok(raw),
        CompressionMode::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            Ok(encoder.finish()?)
        }
        CompressionMode::Zstd => Ok(zstd::stream::encode_all(raw.as_slice(), ZSTD_LEVEL)?),
    }
}
