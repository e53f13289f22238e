//! Daily-rotating visitor keys.
//!
//! A visitor key is `SHA-256(host \n ip \n user_agent \n ‖ daily_salt)`,
//! rendered as unpadded URL-safe base64. The daily salt is
//! `SHA-256(seed ":" day)` where `day` is the UTC epoch day of the event.
//! Without the seed, keys from two different days cannot be linked.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;

/// Seconds in one day bucket
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Length of a rendered visitor key (32 bytes, unpadded base64)
pub const KEY_LEN: usize = 43;

/// Long-lived secret mixed into every daily salt.
///
/// Opaque bytes; the Debug impl never prints them.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretSeed(Vec<u8>);

impl SecretSeed {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Generates a fresh random seed as printable text (16 random bytes,
    /// URL-safe base64), suitable for writing into the config file.
    pub fn generate() -> String {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretSeed(<redacted>)")
    }
}

/// Opaque per-day visitor identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct VisitorKey(String);

impl VisitorKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for VisitorKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for VisitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whole UTC days since the Unix epoch (floor division, so pre-epoch
/// instants land in negative buckets).
pub fn day_bucket(time: DateTime<Utc>) -> i64 {
    time.timestamp().div_euclid(SECONDS_PER_DAY)
}

/// Salt for one day bucket
pub fn daily_salt(seed: &SecretSeed, day: i64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b":");
    hasher.update(day.to_string().as_bytes());
    hasher.finalize().into()
}

/// Derives the visitor key for one request.
pub fn visitor_key(
    seed: &SecretSeed,
    host: &str,
    ip: &IpAddr,
    user_agent: &str,
    time: DateTime<Utc>,
) -> VisitorKey {
    let salt = daily_salt(seed, day_bucket(time));
    let ip = ip.to_string();
    let digest = identity_digest(
        &[host.as_bytes(), ip.as_bytes(), user_agent.as_bytes()],
        &salt,
    );
    VisitorKey(URL_SAFE_NO_PAD.encode(digest))
}

/// Hashes each field followed by a `\n` terminator, then the salt.
fn identity_digest(fields: &[&[u8]], salt: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field);
        hasher.update(b"\n");
    }
    hasher.update(salt);
    hasher.finalize().into()
}

/// Holds the secret seed for the lifetime of the collector.
#[derive(Clone, Debug)]
pub struct Anonymizer {
    seed: SecretSeed,
}

impl Anonymizer {
    pub fn new(seed: SecretSeed) -> Self {
        Self { seed }
    }

    pub fn key(
        &self,
        host: &str,
        ip: &IpAddr,
        user_agent: &str,
        time: DateTime<Utc>,
    ) -> VisitorKey {
        visitor_key(&self.seed, host, ip, user_agent, time)
    }
}
