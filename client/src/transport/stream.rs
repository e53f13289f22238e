//! Persistent-connection delivery.
//!
//! One serializer task owns the connection and drains a bounded queue, so
//! events from one transport reach the collector in submission order. A
//! broken connection is redialed a bounded number of times per event; after
//! that the event is reported and dropped.

use super::{encode_lines, Recorder};
use crate::error::{log_error, DeliveryError, ErrorCallback};
use async_trait::async_trait;
use hindsight::event::RawEvent;
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// A connection to the collector's stream listener
pub type Connection = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens connections for a [`StreamTransport`]
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> io::Result<Connection>;
}

/// Dials a TCP address
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<Connection> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StreamSettings {
    /// Events waiting for the serializer; more are dropped
    pub queue_capacity: usize,
    /// Connection attempts per event, counting the first
    pub max_attempts: u32,
    pub dial_timeout: Duration,
    /// Deadline for writing one event
    pub write_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 3,
            dial_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_millis(5),
        }
    }
}

pub struct StreamTransport {
    queue: Mutex<Option<mpsc::Sender<RawEvent>>>,
    serializer: Mutex<Option<JoinHandle<()>>>,
    on_error: ErrorCallback,
}

impl StreamTransport {
    /// Connects lazily to `addr` over TCP.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self::with_dialer(TcpDialer::new(addr), StreamSettings::default(), log_error())
    }

    /// Starts the serializer on the current tokio runtime. Outside a runtime
    /// the transport starts closed and every recorded event is reported as
    /// [`DeliveryError::Closed`].
    pub fn with_dialer<D: Dialer>(dialer: D, settings: StreamSettings, on_error: ErrorCallback) -> Self {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime, hindsight stream transport starts closed");
            return Self {
                queue: Mutex::new(None),
                serializer: Mutex::new(None),
                on_error,
            };
        };
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let serializer = runtime.spawn(serialize(rx, dialer, settings, on_error.clone()));
        Self {
            queue: Mutex::new(Some(tx)),
            serializer: Mutex::new(Some(serializer)),
            on_error,
        }
    }

    /// Stops accepting events, delivers what is queued and closes the
    /// connection.
    pub async fn close(&self) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let serializer = self
            .serializer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(serializer) = serializer {
            if let Err(e) = serializer.await {
                tracing::error!(error = %e, "hindsight serializer task failed");
            }
        }
    }
}

impl Recorder for StreamTransport {
    fn record(&self, event: RawEvent) {
        let sent = match self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            Some(queue) => queue.try_send(event).map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::QueueFull,
                TrySendError::Closed(_) => DeliveryError::Closed,
            }),
            None => Err(DeliveryError::Closed),
        };
        if let Err(e) = sent {
            (self.on_error)(e);
        }
    }
}

async fn serialize<D: Dialer>(
    mut queue: mpsc::Receiver<RawEvent>,
    dialer: D,
    settings: StreamSettings,
    on_error: ErrorCallback,
) {
    let mut conn: Option<Connection> = None;

    while let Some(event) = queue.recv().await {
        let line = match encode_lines(std::slice::from_ref(&event)) {
            Ok(line) => line,
            Err(e) => {
                on_error(e);
                continue;
            }
        };
        if let Err(e) = deliver(&mut conn, &dialer, &line, &settings).await {
            on_error(e);
        }
    }

    if let Some(mut conn) = conn {
        let _ = conn.shutdown().await;
    }
    debug!("hindsight serializer stopped");
}

/// Writes one line, redialing after each failure up to `max_attempts`.
async fn deliver<D: Dialer>(
    conn: &mut Option<Connection>,
    dialer: &D,
    line: &[u8],
    settings: &StreamSettings,
) -> Result<(), DeliveryError> {
    let mut last = DeliveryError::Connect("no attempt made".to_string());

    for attempt in 1..=settings.max_attempts.max(1) {
        if conn.is_none() {
            match timeout(settings.dial_timeout, dialer.dial()).await {
                Ok(Ok(stream)) => *conn = Some(stream),
                Ok(Err(e)) => {
                    debug!(attempt, error = %e, "dial failed");
                    last = DeliveryError::Connect(e.to_string());
                    continue;
                }
                Err(_) => {
                    debug!(attempt, "dial timed out");
                    last = DeliveryError::Connect("dial timed out".to_string());
                    continue;
                }
            }
        }
        let Some(stream) = conn.as_mut() else {
            continue;
        };

        let written = timeout(settings.write_timeout, async {
            stream.write_all(line).await?;
            stream.flush().await
        })
        .await;

        match written {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                debug!(attempt, error = %e, "write failed, dropping connection");
                last = DeliveryError::Write(e.to_string());
            }
            Err(_) => {
                debug!(attempt, "write timed out, dropping connection");
                last = DeliveryError::Write("write timed out".to_string());
            }
        }
        *conn = None;
    }

    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    #[derive(Default)]
    struct Collector {
        dials: AtomicUsize,
        refuse_dials: AtomicUsize,
        failing_writes: AtomicUsize,
        written: Mutex<Vec<u8>>,
    }

    struct MockDialer(Arc<Collector>);

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(&self) -> io::Result<Connection> {
            self.0.dials.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.0.refuse_dials) {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(Box::new(MockConn(self.0.clone())))
        }
    }

    struct MockConn(Arc<Collector>);

    impl AsyncWrite for MockConn {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if take_one(&self.0.failing_writes) {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")));
            }
            self.0.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Never connects
    struct StalledDialer;

    #[async_trait]
    impl Dialer for StalledDialer {
        async fn dial(&self) -> io::Result<Connection> {
            std::future::pending().await
        }
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn event(path: &str) -> RawEvent {
        RawEvent {
            time: Utc::now(),
            ip: "192.0.2.1".to_string(),
            host: "example.com".to_string(),
            method: "GET".to_string(),
            path: path.to_string(),
            user_agent: "test".to_string(),
            status_code: 200,
            bytes_written: 1,
            duration: Duration::from_millis(2),
        }
    }

    fn recording_errors() -> (ErrorCallback, Arc<Mutex<Vec<DeliveryError>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        (Arc::new(move |e| sink.lock().unwrap().push(e)), errors)
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            write_timeout: Duration::from_secs(1),
            ..StreamSettings::default()
        }
    }

    #[tokio::test]
    async fn test_delivered_after_two_write_failures() {
        let collector = Arc::new(Collector::default());
        collector.failing_writes.store(2, Ordering::SeqCst);
        let (on_error, errors) = recording_errors();

        let transport = StreamTransport::with_dialer(MockDialer(collector.clone()), settings(), on_error);
        transport.record(event("/a"));
        transport.close().await;

        assert_eq!(collector.dials.load(Ordering::SeqCst), 3);
        assert!(errors.lock().unwrap().is_empty());
        let written = collector.written.lock().unwrap().clone();
        let line = std::str::from_utf8(&written).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains(r#""Path":"/a""#));
    }

    #[tokio::test]
    async fn test_gives_up_after_three_write_failures() {
        let collector = Arc::new(Collector::default());
        collector.failing_writes.store(3, Ordering::SeqCst);
        let (on_error, errors) = recording_errors();

        let transport = StreamTransport::with_dialer(MockDialer(collector.clone()), settings(), on_error);
        transport.record(event("/a"));
        transport.close().await;

        assert_eq!(collector.dials.load(Ordering::SeqCst), 3);
        assert!(collector.written.lock().unwrap().is_empty());
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], DeliveryError::Write(_)));
    }

    #[tokio::test]
    async fn test_refused_dials_report_connect_error() {
        let collector = Arc::new(Collector::default());
        collector.refuse_dials.store(usize::MAX, Ordering::SeqCst);
        let (on_error, errors) = recording_errors();

        let transport = StreamTransport::with_dialer(MockDialer(collector.clone()), settings(), on_error);
        transport.record(event("/a"));
        transport.close().await;

        assert_eq!(collector.dials.load(Ordering::SeqCst), 3);
        assert!(matches!(errors.lock().unwrap()[..], [DeliveryError::Connect(_)]));
    }

    #[tokio::test]
    async fn test_connection_reused_between_events() {
        let collector = Arc::new(Collector::default());
        let (on_error, errors) = recording_errors();

        let transport = StreamTransport::with_dialer(MockDialer(collector.clone()), settings(), on_error);
        for path in ["/1", "/2", "/3"] {
            transport.record(event(path));
        }
        transport.close().await;

        assert_eq!(collector.dials.load(Ordering::SeqCst), 1);
        assert!(errors.lock().unwrap().is_empty());
        let written = String::from_utf8(collector.written.lock().unwrap().clone()).unwrap();
        let paths: Vec<String> = written
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["Path"].to_string())
            .collect();
        assert_eq!(paths, vec![r#""/1""#, r#""/2""#, r#""/3""#]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_event() {
        let (on_error, errors) = recording_errors();
        let settings = StreamSettings {
            queue_capacity: 1,
            dial_timeout: Duration::from_secs(60),
            ..settings()
        };

        // The serializer has not run yet, so only one event fits
        let transport = StreamTransport::with_dialer(StalledDialer, settings, on_error);
        transport.record(event("/1"));
        transport.record(event("/2"));

        assert!(matches!(errors.lock().unwrap()[..], [DeliveryError::QueueFull]));
    }

    #[tokio::test]
    async fn test_record_after_close_reports_closed() {
        let collector = Arc::new(Collector::default());
        let (on_error, errors) = recording_errors();

        let transport = StreamTransport::with_dialer(MockDialer(collector.clone()), settings(), on_error);
        transport.close().await;
        transport.record(event("/late"));

        assert!(matches!(errors.lock().unwrap()[..], [DeliveryError::Closed]));
        assert_eq!(collector.dials.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_without_runtime_reports_closed() {
        let collector = Arc::new(Collector::default());
        let (on_error, errors) = recording_errors();

        let transport = StreamTransport::with_dialer(MockDialer(collector.clone()), settings(), on_error);
        transport.record(event("/a"));

        assert!(matches!(errors.lock().unwrap()[..], [DeliveryError::Closed]));
        assert_eq!(collector.dials.load(Ordering::SeqCst), 0);
    }
}
