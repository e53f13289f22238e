//! Event storage sinks.
//!
//! The ingestion pipeline only needs [`Storage::store`]; [`Storage::fetch`]
//! exists for readers such as reporting tools.

use crate::enrich::EnrichedEvent;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

mod sqlite;

pub use sqlite::SqliteStorage;

/// Restricts a fetch to a subset of events
#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// Only events for these hosts; empty means all hosts
    pub hosts: Vec<String>,
}

impl Filter {
    pub fn hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, event: &EnrichedEvent) -> bool {
        self.hosts.is_empty() || self.hosts.iter().any(|h| *h == event.host)
    }
}

/// A sink for enriched events, shared by every ingestion task.
///
/// Implementations must tolerate concurrent calls.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists events in order. May insert a prefix before failing.
    async fn store(&self, events: &[EnrichedEvent]) -> Result<()>;

    /// Events with `from <= time <= until` (second precision), oldest first.
    async fn fetch(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        filter: &Filter,
    ) -> Result<Vec<EnrichedEvent>>;
}

/// In-process storage, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    events: Mutex<Vec<EnrichedEvent>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything stored so far
    pub fn events(&self) -> Vec<EnrichedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, events: &[EnrichedEvent]) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(events);
        Ok(())
    }

    async fn fetch(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        filter: &Filter,
    ) -> Result<Vec<EnrichedEvent>> {
        let (from, until) = (from.timestamp(), until.timestamp());
        let mut events: Vec<EnrichedEvent> = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|e| (from..=until).contains(&e.time.timestamp()) && filter.matches(e))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.time);
        Ok(events)
    }
}
