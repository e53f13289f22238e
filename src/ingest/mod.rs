//! Event ingestion: validation → anonymization → enrichment → storage.

use crate::anonymize::Anonymizer;
use crate::enrich::{EnrichedEvent, Enricher};
use crate::event::{parse_event, ValidationError};
use crate::storage::Storage;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

mod stream;

pub use stream::{StreamListener, StreamSettings};

/// Why one event was not ingested
#[derive(Debug)]
pub enum IngestError {
    /// The producer sent something that is not a valid event
    Invalid(ValidationError),
    /// The event was valid but could not be persisted
    Storage(anyhow::Error),
}

impl IngestError {
    pub fn is_producer_fault(&self) -> bool {
        matches!(self, IngestError::Invalid(_))
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Invalid(e) => write!(f, "{}", e),
            IngestError::Storage(e) => write!(f, "failed to store event: {:#}", e),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<ValidationError> for IngestError {
    fn from(e: ValidationError) -> Self {
        IngestError::Invalid(e)
    }
}

/// Shared by every listener and connection
#[derive(Clone)]
pub struct Pipeline {
    anonymizer: Arc<Anonymizer>,
    enricher: Arc<Enricher>,
    storage: Arc<dyn Storage>,
}

impl Pipeline {
    pub fn new(anonymizer: Anonymizer, enricher: Enricher, storage: Arc<dyn Storage>) -> Self {
        Self {
            anonymizer: Arc::new(anonymizer),
            enricher: Arc::new(enricher),
            storage,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Validates and enriches one wire event without storing it.
    pub fn prepare(&self, line: &[u8]) -> Result<EnrichedEvent, ValidationError> {
        let event = parse_event(line)?;
        let key = self
            .anonymizer
            .key(&event.host, &event.ip, &event.user_agent, event.time);
        Ok(self.enricher.enrich(&event, key))
    }

    /// Full path for one wire event.
    pub async fn ingest(&self, line: &[u8]) -> Result<(), IngestError> {
        let event = self.prepare(line)?;
        self.storage
            .store(std::slice::from_ref(&event))
            .await
            .map_err(IngestError::Storage)?;
        trace!(key = %event.key, host = %event.host, path = %event.path, "ingested");
        Ok(())
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymize::SecretSeed;
    use crate::storage::{Filter, MemoryStorage};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    struct FailingStorage;

    #[async_trait]
    impl Storage for FailingStorage {
        async fn store(&self, _events: &[EnrichedEvent]) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }

        async fn fetch(
            &self,
            _from: DateTime<Utc>,
            _until: DateTime<Utc>,
            _filter: &Filter,
        ) -> anyhow::Result<Vec<EnrichedEvent>> {
            Ok(Vec::new())
        }
    }

    fn line() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Time": "2024-02-11T13:00:00Z",
            "IP": "203.0.113.7",
            "Host": "example.com",
            "Method": "GET",
            "Path": "/",
            "UserAgent": "curl/8.5.0",
            "StatusCode": 200,
            "BytesWritten": 10,
            "Duration": 1
        }))
        .unwrap()
    }

    fn pipeline(storage: Arc<dyn Storage>) -> Pipeline {
        Pipeline::new(
            Anonymizer::new(SecretSeed::new("seed")),
            Enricher::default(),
            storage,
        )
    }

    #[tokio::test]
    async fn test_valid_line_is_stored_without_raw_identity() {
        let storage = Arc::new(MemoryStorage::new());
        pipeline(storage.clone()).ingest(&line()).await.unwrap();

        let events = storage.events();
        assert_eq!(events.len(), 1);
        let stored = serde_json::to_string(&events[0]).unwrap();
        assert!(!stored.contains("203.0.113.7"));
        assert!(!stored.contains("curl/8.5.0"));
        assert_eq!(events[0].country_code, "XX");
    }

    #[tokio::test]
    async fn test_invalid_line_is_producer_fault() {
        let storage = Arc::new(MemoryStorage::new());
        let err = pipeline(storage.clone()).ingest(b"{}").await.unwrap_err();
        assert!(err.is_producer_fault());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_collector_fault() {
        let err = pipeline(Arc::new(FailingStorage))
            .ingest(&line())
            .await
            .unwrap_err();
        assert!(!err.is_producer_fault());
        assert!(err.to_string().contains("disk full"));
    }
}
