// HTTP ingestion API

mod ingestion;

pub use ingestion::{create_router, AppState, IngestResponse, INGEST_PATH};
