//! Error types for the log forwarder

use std::fmt;

pub type Result<T> = std::result::Result<T, ForwarderError>;

#[derive(Debug)]
pub enum ForwarderError {
    /// IO operation failed
    Io(std::io::Error),

    /// HTTP request failed
    Http(reqwest::Error),

    /// JSON serialization failed
    Json(serde_json::Error),

    /// Missing or invalid mandatory configuration
    Config(String),

    /// The sink refused or failed to accept a batch
    Delivery(String),

    /// A record or batch could not be encoded for the wire
    Encoding(String),

    /// The sender thread could not be spawned or its runtime built
    Runtime(String),
}

impl fmt::Display for ForwarderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwarderError::Io(err) => write!(f, "IO error: {}", err),
            ForwarderError::Http(err) => write!(f, "HTTP error: {}", err),
            ForwarderError::Json(err) => write!(f, "JSON error: {}", err),
            ForwarderError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ForwarderError::Delivery(msg) => write!(f, "Delivery error: {}", msg),
            ForwarderError::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            ForwarderError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl ForwarderError {
    /// Whether resending the same batch could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ForwarderError::Config(_) | ForwarderError::Encoding(_))
    }
}

impl std::error::Error for ForwarderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForwarderError::Io(err) => Some(err),
            ForwarderError::Http(err) => Some(err),
            ForwarderError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ForwarderError {
    fn from(err: std::io::Error) -> Self {
        ForwarderError::Io(err)
    }
}

impl From<reqwest::Error> for ForwarderError {
    fn from(err: reqwest::Error) -> Self {
        ForwarderError::Http(err)
    }
}

impl From<serde_json::Error> for ForwarderError {
    fn from(err: serde_json::Error) -> Self {
        ForwarderError::Json(err)
    }
}
