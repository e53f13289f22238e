use crate::anonymize::VisitorKey;
use crate::event::NormalizedEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

pub mod geo;
pub mod user_agent;

pub use geo::{GeoTable, NoGeo};
pub use user_agent::HeuristicClassifier;

/// Country code stored when the IP cannot be located
pub const UNKNOWN_COUNTRY: &str = "XX";

/// Time zone stored when the IP cannot be located
pub const UTC_TIME_ZONE: &str = "UTC";

/// Coarse device class derived from the user agent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Bot,
    Mobile,
    Tablet,
    Desktop,
    #[default]
    Unknown,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Bot => "bot",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "bot" => DeviceClass::Bot,
            "mobile" => DeviceClass::Mobile,
            "tablet" => DeviceClass::Tablet,
            "desktop" => DeviceClass::Desktop,
            _ => DeviceClass::Unknown,
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameAndVersion {
    pub name: String,
    pub version: String,
}

impl NameAndVersion {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for NameAndVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Result of classifying a user-agent string
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub browser: NameAndVersion,
    pub os: NameAndVersion,
    pub device: DeviceClass,
}

/// Result of a geo-IP lookup
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Location {
    pub country_code: String,
    pub time_zone: String,
}

impl Location {
    /// Sentinel used when a lookup fails
    pub fn unknown() -> Self {
        Self {
            country_code: UNKNOWN_COUNTRY.to_string(),
            time_zone: UTC_TIME_ZONE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupError {
    /// No entry covers the address
    NotFound(IpAddr),
    /// The backing database failed
    Backend(String),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::NotFound(ip) => write!(f, "unknown IP address {}", ip),
            LookupError::Backend(msg) => write!(f, "geo lookup failed: {}", msg),
        }
    }
}

impl std::error::Error for LookupError {}

/// Maps a user-agent string to browser, OS and device class.
pub trait UserAgentClassifier: Send + Sync {
    fn classify(&self, user_agent: &str) -> UserAgentInfo;
}

/// Maps an IP address to a country and time zone.
///
/// Implementations are loaded once at startup and shared read-only.
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: &IpAddr) -> Result<Location, LookupError>;
}

/// Storage-ready record. Raw IP and user agent are not retained.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnrichedEvent {
    pub key: VisitorKey,
    pub time: DateTime<Utc>,
    pub host: String,
    pub path: String,
    pub method: String,
    pub device: DeviceClass,
    pub browser: NameAndVersion,
    pub os: NameAndVersion,
    pub country_code: String,
    pub time_zone: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub bytes_written: u64,
}

/// Combines the user-agent and geo collaborators.
#[derive(Clone)]
pub struct Enricher {
    classifier: Arc<dyn UserAgentClassifier>,
    locator: Arc<dyn GeoLocator>,
}

impl Enricher {
    pub fn new(classifier: Arc<dyn UserAgentClassifier>, locator: Arc<dyn GeoLocator>) -> Self {
        Self {
            classifier,
            locator,
        }
    }

    /// Builds the storage record. Never fails: a lookup miss is stored as
    /// [`UNKNOWN_COUNTRY`] / [`UTC_TIME_ZONE`].
    pub fn enrich(&self, event: &NormalizedEvent, key: VisitorKey) -> EnrichedEvent {
        let ua = self.classifier.classify(&event.user_agent);
        let location = self.locator.locate(&event.ip).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "geo lookup failed, using sentinel location");
            Location::unknown()
        });

        EnrichedEvent {
            key,
            time: event.time,
            host: event.host.clone(),
            path: event.path.clone(),
            method: event.method.clone(),
            device: ua.device,
            browser: ua.browser,
            os: ua.os,
            country_code: location.country_code,
            time_zone: location.time_zone,
            status_code: event.status_code,
            duration_ms: event.duration_ms(),
            bytes_written: event.bytes_written,
        }
    }
}

impl Default for Enricher {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicClassifier), Arc::new(NoGeo))
    }
}
