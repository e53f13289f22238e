use crate::anonymize::SecretSeed;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Key of the top-level seed entry in the config file
const SEED_KEY: &str = "random_salt_seed";

/// Complete Hindsight configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HindsightConfig {
    /// Secret mixed into every daily salt; generated on first start
    #[serde(default)]
    pub random_salt_seed: String,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub geoip: GeoipConfig,
}

impl HindsightConfig {
    pub fn seed(&self) -> SecretSeed {
        SecretSeed::new(self.random_salt_seed.as_bytes())
    }

    /// Applies `HINDSIGHT_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("HINDSIGHT_STREAM_LISTEN") {
            self.ingest.stream_listen = v;
        }
        if let Some(v) = var("HINDSIGHT_HTTP_LISTEN") {
            self.ingest.http_listen = v;
        }
        if let Some(v) = var("HINDSIGHT_DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Some(v) = var("HINDSIGHT_API_TOKEN") {
            self.ingest.api_token = Some(v).filter(|t| !t.is_empty());
        }
    }
}

/// Ingestion listeners
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Persistent NDJSON listener; should not be public
    #[serde(default = "default_stream_listen")]
    pub stream_listen: String,
    /// HTTP ingestion endpoint
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// When set, HTTP producers must send it as a bearer token
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_stream_listen() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_http_listen() -> String {
    "127.0.0.1:8766".to_string()
}

fn default_max_line_bytes() -> usize {
    64 * 1024
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stream_listen: default_stream_listen(),
            http_listen: default_http_listen(),
            max_line_bytes: default_max_line_bytes(),
            max_body_bytes: default_max_body_bytes(),
            api_token: None,
        }
    }
}

/// Event database
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("hindsight.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Location lookup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoipConfig {
    /// Network → location table; without it every lookup misses
    #[serde(default)]
    pub table_path: Option<PathBuf>,
}

/// Load configuration from TOML file.
///
/// A missing or empty seed is generated and written back into the file
/// before the configuration is returned.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<HindsightConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("could not load config file from {}", path.display()))?;
    let mut config: HindsightConfig = toml::from_str(&contents)
        .with_context(|| format!("could not parse config file {}", path.display()))?;

    if config.random_salt_seed.is_empty() {
        config.random_salt_seed = SecretSeed::generate();
        let rewritten = with_seed(&contents, &config.random_salt_seed);
        std::fs::write(path, rewritten)
            .with_context(|| format!("failed to rewrite config file {}", path.display()))?;
        info!(path = %path.display(), "Generated new random salt seed");
    }

    Ok(config)
}

/// Replaces the top-level seed line, or inserts one as the first line.
///
/// Top-level keys must precede the first table header, so a new seed is
/// never appended at the end.
fn with_seed(contents: &str, seed: &str) -> String {
    let entry = format!("{} = {:?} # AUTO-GENERATED", SEED_KEY, seed);
    let mut out = String::with_capacity(contents.len() + entry.len() + 1);
    let mut replaced = false;

    for line in contents.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('[') {
            // Tables begin; anything below is not top level
            if !replaced {
                out.insert_str(0, &format!("{}\n", entry));
                replaced = true;
            }
        } else if !replaced && is_seed_line(trimmed) {
            out.push_str(&entry);
            out.push('\n');
            replaced = true;
            continue;
        }
        out.push_str(line);
    }

    if !replaced {
        out.insert_str(0, &format!("{}\n", entry));
    }
    out
}

fn is_seed_line(line: &str) -> bool {
    line.strip_prefix(SEED_KEY)
        .map(|rest| rest.trim_start().starts_with('='))
        .unwrap_or(false)
}
