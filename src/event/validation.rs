use super::NormalizedEvent;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// The exact key set of a wire event
pub const FIELDS: [&str; 9] = [
    "Time",
    "IP",
    "Host",
    "Method",
    "Path",
    "UserAgent",
    "StatusCode",
    "BytesWritten",
    "Duration",
];

/// Validation errors for wire events
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Not parseable as JSON at all
    InvalidJson(String),
    /// Valid JSON, but not an object
    NotAnObject,
    UnexpectedField(String),
    MissingField(&'static str),
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    InvalidTime(String),
    InvalidIp(String),
    StatusCodeOutOfRange(i128),
    NegativeBytesWritten(i128),
    NegativeDuration(i128),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidJson(e) => write!(f, "event is not valid JSON: {}", e),
            ValidationError::NotAnObject => write!(f, "event must be a JSON object"),
            ValidationError::UnexpectedField(key) => {
                write!(f, "event has unexpected field {:?}", key)
            }
            ValidationError::MissingField(key) => write!(f, "event missing the {:?} key", key),
            ValidationError::WrongType { field, expected } => {
                write!(f, "event {:?} was not {}", field, expected)
            }
            ValidationError::InvalidTime(e) => {
                write!(f, "event 'Time' key not a string formatted in RFC3339: {}", e)
            }
            ValidationError::InvalidIp(s) => {
                write!(f, "event 'IP' key did not contain a valid IP: {:?}", s)
            }
            ValidationError::StatusCodeOutOfRange(n) => {
                write!(f, "event 'StatusCode' should be between 100 and 599, got {}", n)
            }
            ValidationError::NegativeBytesWritten(n) => {
                write!(f, "event 'BytesWritten' should be non-negative, got {}", n)
            }
            ValidationError::NegativeDuration(n) => {
                write!(f, "event 'Duration' should be non-negative, got {}", n)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Parses a wire event and validates it into a NormalizedEvent.
///
/// Validation rules:
/// - The object has exactly the keys in [`FIELDS`]; extra keys are rejected
/// - Time: RFC 3339 string
/// - IP: syntactically valid IPv4 or IPv6 address
/// - Host, Method, Path, UserAgent: any string
/// - StatusCode: integer in [100, 600)
/// - BytesWritten, Duration (milliseconds): non-negative integers
///
/// The first violation found is returned; nothing is partially populated.
pub fn parse_event(bytes: &[u8]) -> Result<NormalizedEvent, ValidationError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(ValidationError::NotAnObject);
    };

    // Reject unknown keys before looking at any values
    if let Some(key) = object.keys().find(|k| !FIELDS.contains(&k.as_str())) {
        return Err(ValidationError::UnexpectedField(key.clone()));
    }

    let time = string_field(&object, "Time")?;
    let time = DateTime::parse_from_rfc3339(time)
        .map_err(|e| ValidationError::InvalidTime(e.to_string()))?
        .with_timezone(&Utc);

    let ip = string_field(&object, "IP")?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ValidationError::InvalidIp(ip.to_string()))?;

    let host = string_field(&object, "Host")?.to_string();
    let method = string_field(&object, "Method")?.to_string();
    let path = string_field(&object, "Path")?.to_string();
    let user_agent = string_field(&object, "UserAgent")?.to_string();

    let status = integer_field(&object, "StatusCode")?;
    if !(100..600).contains(&status) {
        return Err(ValidationError::StatusCodeOutOfRange(status));
    }

    let bytes_written = integer_field(&object, "BytesWritten")?;
    let bytes_written =
        u64::try_from(bytes_written).map_err(|_| ValidationError::NegativeBytesWritten(bytes_written))?;

    let duration = integer_field(&object, "Duration")?;
    let duration_ms =
        u64::try_from(duration).map_err(|_| ValidationError::NegativeDuration(duration))?;

    Ok(NormalizedEvent {
        time,
        ip,
        host,
        method,
        path,
        user_agent,
        status_code: status as u16,
        bytes_written,
        duration: Duration::from_millis(duration_ms),
    })
}

fn string_field<'a>(
    object: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, ValidationError> {
    object
        .get(key)
        .ok_or(ValidationError::MissingField(key))?
        .as_str()
        .ok_or(ValidationError::WrongType {
            field: key,
            expected: "a string",
        })
}

/// Integers only: 14.0 and "14" are both rejected.
fn integer_field(object: &Map<String, Value>, key: &'static str) -> Result<i128, ValidationError> {
    let value = object.get(key).ok_or(ValidationError::MissingField(key))?;
    value
        .as_i64()
        .map(i128::from)
        .or_else(|| value.as_u64().map(i128::from))
        .ok_or(ValidationError::WrongType {
            field: key,
            expected: "an integer",
        })
}
