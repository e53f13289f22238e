use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::net::IpAddr;
use std::time::Duration;

mod validation;

pub use validation::{parse_event, ValidationError, FIELDS};

/// RawEvent is one captured request/response cycle, as put on the wire.
///
/// Produced by the capture middleware and serialized as a JSON object with
/// exactly nine keys: `Time`, `IP`, `Host`, `Method`, `Path`, `UserAgent`,
/// `StatusCode`, `BytesWritten` and `Duration` (whole milliseconds).
#[derive(Clone, Debug, PartialEq)]
pub struct RawEvent {
    /// Request start time
    pub time: DateTime<Utc>,

    /// Client address as observed by the web server (unvalidated)
    pub ip: String,

    pub host: String,
    pub method: String,

    /// Request path including the query string
    pub path: String,

    pub user_agent: String,

    /// Final response status
    pub status_code: u16,

    /// Sum of all body bytes written to the client
    pub bytes_written: u64,

    /// Wall-clock time spent serving the request
    pub duration: Duration,
}

/// Borrowed wire view of a RawEvent
#[derive(Serialize)]
struct WireEvent<'a> {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "IP")]
    ip: &'a str,
    #[serde(rename = "Host")]
    host: &'a str,
    #[serde(rename = "Method")]
    method: &'a str,
    #[serde(rename = "Path")]
    path: &'a str,
    #[serde(rename = "UserAgent")]
    user_agent: &'a str,
    #[serde(rename = "StatusCode")]
    status_code: u16,
    #[serde(rename = "BytesWritten")]
    bytes_written: u64,
    #[serde(rename = "Duration")]
    duration: u64,
}

impl Serialize for RawEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEvent {
            time: self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
            ip: &self.ip,
            host: &self.host,
            method: &self.method,
            path: &self.path,
            user_agent: &self.user_agent,
            status_code: self.status_code,
            bytes_written: self.bytes_written,
            duration: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
        }
        .serialize(serializer)
    }
}

/// NormalizedEvent is a RawEvent that passed strict schema validation.
///
/// Only [`parse_event`] constructs one from wire bytes; every range and
/// syntax rule has been checked by then.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedEvent {
    pub time: DateTime<Utc>,
    pub ip: IpAddr,
    pub host: String,
    pub method: String,
    pub path: String,
    pub user_agent: String,
    /// Always in [100, 600)
    pub status_code: u16,
    pub bytes_written: u64,
    pub duration: Duration,
}

impl NormalizedEvent {
    /// Parses and validates a single wire event.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ValidationError> {
        validation::parse_event(bytes)
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}
