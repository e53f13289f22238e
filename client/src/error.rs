use std::fmt;
use std::sync::Arc;

/// Receives every event that could not be delivered.
pub type ErrorCallback = Arc<dyn Fn(DeliveryError) + Send + Sync>;

/// Why an event did not reach the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The event could not be serialized; retrying cannot help
    Encode(String),
    /// No connection could be established
    Connect(String),
    /// The connection broke or stalled while sending
    Write(String),
    /// The transport's queue was full and the event was dropped
    QueueFull,
    /// The transport was closed before the event was submitted
    Closed,
    /// The HTTP request itself failed
    Http(String),
    /// The collector answered with something other than success
    Rejected { status: u16, body: String },
}

impl DeliveryError {
    /// Whether a fresh connection could fix this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Connect(_) | DeliveryError::Write(_))
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Encode(msg) => write!(f, "could not encode event: {}", msg),
            DeliveryError::Connect(msg) => write!(f, "could not connect to collector: {}", msg),
            DeliveryError::Write(msg) => write!(f, "could not send event: {}", msg),
            DeliveryError::QueueFull => write!(f, "delivery queue full, event dropped"),
            DeliveryError::Closed => write!(f, "transport closed, event dropped"),
            DeliveryError::Http(msg) => write!(f, "ingestion request failed: {}", msg),
            DeliveryError::Rejected { status, body } => {
                write!(f, "collector response({}): {}", status, body)
            }
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Default callback: log and move on
pub(crate) fn log_error() -> ErrorCallback {
    Arc::new(|e| tracing::warn!(error = %e, "hindsight event not delivered"))
}
