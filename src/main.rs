use anyhow::{Context, Result};
use hindsight::anonymize::Anonymizer;
use hindsight::api::{create_router, AppState};
use hindsight::config::load_config;
use hindsight::enrich::{Enricher, GeoLocator, GeoTable, HeuristicClassifier, NoGeo};
use hindsight::ingest::{stop_requested, Pipeline, StreamListener, StreamSettings};
use hindsight::storage::SqliteStorage;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hindsight=info".into()),
        )
        .init();

    info!("Hindsight starting...");

    let config_path =
        std::env::var("HINDSIGHT_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let mut config = load_config(&config_path)?;
    config.apply_env();

    info!(
        config = %config_path,
        stream_listen = %config.ingest.stream_listen,
        http_listen = %config.ingest.http_listen,
        database = %config.storage.database_path.display(),
        auth = config.ingest.api_token.is_some(),
        "Configuration loaded"
    );

    let storage = Arc::new(
        SqliteStorage::open(&config.storage.database_path)
            .context("Failed to initialize event storage")?,
    );
    info!("Event storage initialized");

    let locator: Arc<dyn GeoLocator> = match &config.geoip.table_path {
        Some(path) => {
            let table = GeoTable::load(path).context("Failed to load geoip table")?;
            info!(networks = table.len(), "Geoip table loaded");
            Arc::new(table)
        }
        None => {
            info!("No geoip table configured, locations will be unknown");
            Arc::new(NoGeo)
        }
    };

    let pipeline = Pipeline::new(
        Anonymizer::new(config.seed()),
        Enricher::new(Arc::new(HeuristicClassifier), locator),
        storage,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Both listeners must bind before anything is served
    let stream = StreamListener::bind(
        config.ingest.stream_listen.as_str(),
        StreamSettings {
            max_line_bytes: config.ingest.max_line_bytes,
        },
    )
    .await?;
    let http = tokio::net::TcpListener::bind(&config.ingest.http_listen)
        .await
        .context("Failed to bind HTTP ingestion address")?;
    info!(addr = %config.ingest.http_listen, "HTTP ingestion listening");

    let router = create_router(AppState {
        pipeline: pipeline.clone(),
        max_body_bytes: config.ingest.max_body_bytes,
        api_token: config.ingest.api_token.clone(),
    });

    let stream_handle = tokio::spawn(stream.serve(pipeline, shutdown_rx.clone()));

    let mut http_shutdown = shutdown_rx;
    let http_handle = tokio::spawn(async move {
        axum::serve(http, router)
            .with_graceful_shutdown(async move { stop_requested(&mut http_shutdown).await })
            .await
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    shutdown_tx.send_replace(true);

    match stream_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %format!("{:#}", e), "Stream ingestion failed"),
        Err(e) => error!(error = %e, "Stream ingestion task failed"),
    }
    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP ingestion server error"),
        Err(e) => error!(error = %e, "HTTP ingestion task failed"),
    }

    info!("Hindsight stopped");
    Ok(())
}
