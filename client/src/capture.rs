use crate::transport::Recorder;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{
        header::{HOST, USER_AGENT},
        HeaderMap,
    },
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use chrono::Utc;
use hindsight::event::RawEvent;
use http_body::{Frame, SizeHint};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Recorded when no client address can be determined
pub const UNKNOWN_IP: &str = "0.0.0.0";

/// State for [`capture`], used with `axum::middleware::from_fn_with_state`.
#[derive(Clone)]
pub struct CaptureState {
    pub recorder: Arc<dyn Recorder>,
    /// Prefer the first `X-Forwarded-For` address over the socket address
    pub trust_proxy: bool,
}

impl CaptureState {
    pub fn new(recorder: Arc<dyn Recorder>) -> Self {
        Self {
            recorder,
            trust_proxy: false,
        }
    }

    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }
}

/// Records one [`RawEvent`] per request.
///
/// The response passes through unchanged. The event is handed to the
/// recorder once the response body has been fully sent (or dropped), so
/// `Duration` covers the handler and body streaming.
///
/// The socket address comes from `ConnectInfo<SocketAddr>`; serve the app
/// with `into_make_service_with_connect_info` to make it available.
pub async fn capture(State(state): State<CaptureState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let time = Utc::now();

    let ip = client_ip(&request, state.trust_proxy);
    let host = request_host(&request);
    let method = request.method().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let user_agent = header_text(request.headers(), USER_AGENT.as_str());

    let response = next.run(request).await;

    let event = RawEvent {
        time,
        ip,
        host,
        method,
        path,
        user_agent,
        status_code: response.status().as_u16(),
        bytes_written: 0,
        duration: Duration::ZERO,
    };

    let (parts, body) = response.into_parts();
    let body = CountingBody {
        inner: body,
        written: 0,
        pending: Some(Pending {
            event,
            started,
            recorder: state.recorder,
        }),
    };
    Response::from_parts(parts, Body::new(body))
}

fn client_ip(request: &Request, trust_proxy: bool) -> String {
    let socket = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let forwarded = if trust_proxy {
        forwarded_for(request.headers())
    } else {
        None
    };

    forwarded
        .or(socket)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// First address of `X-Forwarded-For`, if it parses
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn request_host(request: &Request) -> String {
    match request.headers().get(HOST) {
        Some(value) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
        None => request
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default(),
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

struct Pending {
    event: RawEvent,
    started: Instant,
    recorder: Arc<dyn Recorder>,
}

/// Response body that counts data bytes and reports the event when done.
struct CountingBody {
    inner: Body,
    written: u64,
    pending: Option<Pending>,
}

impl CountingBody {
    fn finish(&mut self) {
        if let Some(Pending {
            mut event,
            started,
            recorder,
        }) = self.pending.take()
        {
            event.bytes_written = self.written;
            event.duration = started.elapsed();
            recorder.record(event);
        }
    }
}

impl http_body::Body for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.written += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.finish(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}
