// Wire event model and validation
pub mod event;

// Daily-rotating visitor keys
pub mod anonymize;

// User agent and location enrichment
pub mod enrich;

// Event sinks
pub mod storage;

// Validation → anonymization → enrichment → storage, and the stream listener
pub mod ingest;

// HTTP ingestion API
pub mod api;

// Bearer token checks for HTTP ingestion
pub mod auth;

// TOML configuration and secret seed lifecycle
pub mod config;
