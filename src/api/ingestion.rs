use crate::auth::{authorize, TokenError};
use crate::ingest::{IngestError, Pipeline};
use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use http_body_util::LengthLimitError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

/// Path events are posted to
pub const INGEST_PATH: &str = "/api/ingest";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Bearer token producers must present, if any
    pub api_token: Option<String>,
}

/// Result of one ingestion request.
///
/// Also returned for rejected requests, with `ingested` counting the events
/// stored before the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    #[serde(rename = "OK")]
    pub ok: bool,
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "Ingested")]
    pub ingested: u64,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Single,
    Ndjson,
}

/// Create API router with the ingestion endpoint
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(INGEST_PATH, post(ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// POST /api/ingest - one JSON event or an NDJSON batch
async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<IngestResponse>, AppError> {
    authorize(&headers, state.api_token.as_deref())?;

    let kind = body_kind(&headers)?;

    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| {
            let e = e.into_inner();
            if e.downcast_ref::<LengthLimitError>().is_some() {
                AppError::PayloadTooLarge(state.max_body_bytes)
            } else {
                AppError::BadRequest(format!("failed to read body: {}", e))
            }
        })?;

    match kind {
        BodyKind::Single => ingest_single(&state.pipeline, &body).await,
        BodyKind::Ndjson => ingest_ndjson(&state.pipeline, &body).await,
    }
}

async fn ingest_single(pipeline: &Pipeline, body: &[u8]) -> Result<Json<IngestResponse>, AppError> {
    match pipeline.ingest(body).await {
        Ok(()) => Ok(Json(success(1))),
        Err(IngestError::Invalid(e)) => {
            debug!(error = %e, "rejected event");
            Err(AppError::BadRequest(e.to_string()))
        }
        Err(IngestError::Storage(e)) => {
            error!(error = %format!("{:#}", e), "failed to store event");
            Err(AppError::Storage {
                ingested: 0,
                message: format!("failed to store event: {:#}", e),
            })
        }
    }
}

/// Lines are processed in order. A malformed line stops the batch; storage
/// failures are counted and the batch continues.
async fn ingest_ndjson(pipeline: &Pipeline, body: &[u8]) -> Result<Json<IngestResponse>, AppError> {
    let mut ingested: u64 = 0;
    let mut failed: u64 = 0;
    let mut first_failure: Option<String> = None;

    for (i, line) in body.split(|b| *b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match pipeline.ingest(line).await {
            Ok(()) => ingested += 1,
            Err(IngestError::Invalid(e)) => {
                debug!(line = i + 1, ingested, error = %e, "rejected batch");
                return Err(AppError::InvalidLine {
                    ingested,
                    message: format!("line {}: {}", i + 1, e),
                });
            }
            Err(IngestError::Storage(e)) => {
                error!(line = i + 1, error = %format!("{:#}", e), "failed to store event");
                failed += 1;
                first_failure.get_or_insert_with(|| format!("line {}: {:#}", i + 1, e));
            }
        }
    }

    if let Some(first) = first_failure {
        warn!(ingested, failed, "batch partially stored");
        return Err(AppError::Storage {
            ingested,
            message: format!("failed to store {} event(s); first error at {}", failed, first),
        });
    }

    Ok(Json(success(ingested)))
}

fn body_kind(headers: &HeaderMap) -> Result<BodyKind, AppError> {
    let value = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let mime = value.split(';').next().unwrap_or_default().trim();

    if mime.eq_ignore_ascii_case("application/json") || mime.eq_ignore_ascii_case("text/json") {
        Ok(BodyKind::Single)
    } else if mime.eq_ignore_ascii_case("application/x-ndjson")
        || mime.eq_ignore_ascii_case("application/ndjson")
    {
        Ok(BodyKind::Ndjson)
    } else {
        Err(AppError::NotAcceptable(value.to_string()))
    }
}

fn success(ingested: u64) -> IngestResponse {
    IngestResponse {
        ok: true,
        status: StatusCode::OK.as_u16(),
        ingested,
        error: None,
    }
}

/// Application error types
#[derive(Debug)]
enum AppError {
    Unauthorized(TokenError),
    NotAcceptable(String),
    PayloadTooLarge(usize),
    BadRequest(String),
    InvalidLine { ingested: u64, message: String },
    Storage { ingested: u64, message: String },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, ingested, message) = match self {
            AppError::Unauthorized(e) => (StatusCode::UNAUTHORIZED, 0, e.to_string()),
            AppError::NotAcceptable(content_type) => (
                StatusCode::NOT_ACCEPTABLE,
                0,
                format!("unsupported content type {:?}", content_type),
            ),
            AppError::PayloadTooLarge(limit) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                0,
                format!("body exceeds {} bytes", limit),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, 0, msg),
            AppError::InvalidLine { ingested, message } => {
                (StatusCode::UNPROCESSABLE_ENTITY, ingested, message)
            }
            AppError::Storage { ingested, message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, ingested, message)
            }
        };

        let body = Json(IngestResponse {
            ok: false,
            status: status.as_u16(),
            ingested,
            error: Some(message),
        });
        (status, body).into_response()
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        AppError::Unauthorized(e)
    }
}
