//! One-shot HTTP delivery: one POST per event or batch.

use super::{encode_lines, Recorder};
use crate::error::{log_error, DeliveryError, ErrorCallback};
use hindsight::api::IngestResponse;
use hindsight::event::RawEvent;
use reqwest::{header, Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// Longest response body excerpt kept for a rejected request
const MAX_ERROR_BODY: usize = 1024;

#[derive(Clone, Debug)]
pub struct HttpSettings {
    /// Sent as `Authorization: Bearer <token>`
    pub api_token: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            api_token: None,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Arc<str>,
    auth: Option<Arc<str>>,
    on_error: ErrorCallback,
}

impl HttpTransport {
    /// `endpoint` is the full ingestion URL, e.g. `http://127.0.0.1:8766/api/ingest`.
    pub fn new(endpoint: impl Into<String>, settings: HttpSettings) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .user_agent(concat!("hindsight-rust-client/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let endpoint: String = endpoint.into();
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth: settings
                .api_token
                .filter(|t| !t.is_empty())
                .map(|t| format!("Bearer {}", t).into()),
            on_error: log_error(),
        })
    }

    pub fn with_error_handler(mut self, on_error: ErrorCallback) -> Self {
        self.on_error = on_error;
        self
    }

    /// Posts events and waits for the collector's verdict.
    ///
    /// One event goes as `application/json`, several as NDJSON.
    pub async fn send(&self, events: &[RawEvent]) -> Result<(), DeliveryError> {
        let (body, content_type) = match events {
            [] => return Ok(()),
            [event] => (
                serde_json::to_vec(event).map_err(|e| DeliveryError::Encode(e.to_string()))?,
                "application/json",
            ),
            _ => (encode_lines(events)?, "application/x-ndjson"),
        };

        let mut request = self
            .client
            .post(&*self.endpoint)
            .header(header::CONTENT_TYPE, content_type)
            .body(body);
        if let Some(auth) = &self.auth {
            request = request.header(header::AUTHORIZATION, &**auth);
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let body = read_prefix(&mut response, MAX_ERROR_BODY).await;
        if status.is_success() && accepted(&body) {
            return Ok(());
        }

        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    /// Delivers a batch in the background.
    pub fn record_batch(&self, events: Vec<RawEvent>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            (self.on_error)(DeliveryError::Http("no async runtime to send from".to_string()));
            return;
        };
        let transport = self.clone();
        runtime.spawn(async move {
            if let Err(e) = transport.send(&events).await {
                (transport.on_error)(e);
            }
        });
    }
}

impl Recorder for HttpTransport {
    fn record(&self, event: RawEvent) {
        self.record_batch(vec![event]);
    }
}

/// A 2xx body counts as success only if it is an ingestion response saying so
fn accepted(body: &[u8]) -> bool {
    serde_json::from_slice::<IngestResponse>(body)
        .map(|r| r.ok)
        .unwrap_or(false)
}

/// Reads at most `limit` bytes of the body; read errors end the excerpt.
async fn read_prefix(response: &mut reqwest::Response, limit: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - out.len());
                out.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_requires_ok_flag() {
        assert!(accepted(br#"{"OK":true,"Status":200,"Ingested":1}"#));
        assert!(!accepted(br#"{"OK":false,"Status":500,"Ingested":0,"Error":"x"}"#));
        assert!(!accepted(b"ok"));
        assert!(!accepted(b""));
    }

    #[test]
    fn test_empty_token_sends_no_auth() {
        let transport = HttpTransport::new(
            "http://127.0.0.1:1/api/ingest",
            HttpSettings {
                api_token: Some(String::new()),
                ..HttpSettings::default()
            },
        )
        .unwrap();
        assert!(transport.auth.is_none());
    }
}
