//! Persistent-connection listener: one JSON event per line.
//!
//! Every accepted connection is served by its own task. A malformed line
//! ends only that session; storage failures are logged and the session
//! keeps reading. On shutdown the accept loop stops, each session finishes
//! the event it is processing, and its socket is closed.

use super::{stop_requested, IngestError, Pipeline};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest line excerpt written to the log for a rejected event
const LOG_EXCERPT_BYTES: usize = 256;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug)]
pub struct StreamSettings {
    /// Longest accepted line, excluding the terminator
    pub max_line_bytes: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_line_bytes: 64 * 1024,
        }
    }
}

pub struct StreamListener {
    listener: TcpListener,
    settings: StreamSettings,
}

impl StreamListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A, settings: StreamSettings) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("could not start ingestion listener")?;
        Ok(Self { listener, settings })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` turns true (or its sender is
    /// dropped), then waits for every session to finish.
    pub async fn serve(self, pipeline: Pipeline, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "Stream ingestion listening");
        accept_loop(self.listener, self.settings, pipeline, shutdown).await;
        info!("Stream ingestion stopped");
        Ok(())
    }
}

#[async_trait]
trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

async fn accept_loop<A: Acceptor>(
    acceptor: A,
    settings: StreamSettings,
    pipeline: Pipeline,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop_requested(&mut shutdown) => break,
            accepted = acceptor.accept() => match accepted {
                Ok((socket, peer)) => {
                    sessions.spawn(run_session(
                        socket,
                        peer,
                        pipeline.clone(),
                        settings,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    // Per-connection failures (e.g. reset before accept) are not fatal,
                    // but errors like EMFILE repeat until a descriptor frees up
                    warn!(error = %e, "error accepting connection");
                    tokio::select! {
                        _ = stop_requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "stream session task failed");
                }
            }
        }
    }

    // No new connections from here on
    drop(acceptor);
    info!(open_sessions = sessions.len(), "Stream ingestion shutting down");

    while let Some(joined) = sessions.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "stream session task failed");
        }
    }
}

async fn run_session(
    socket: TcpStream,
    peer: SocketAddr,
    pipeline: Pipeline,
    settings: StreamSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let session = Uuid::now_v7();
    debug!(%session, %peer, "stream session opened");

    let mut reader = BufReader::new(socket);
    let mut line = Vec::with_capacity(1024);
    let mut ingested: u64 = 0;

    loop {
        line.clear();
        let read = tokio::select! {
            _ = stop_requested(&mut shutdown) => {
                debug!(%session, "closing stream session for shutdown");
                break;
            }
            read = read_line(&mut reader, &mut line, settings.max_line_bytes) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(%session, %peer, error = %e, "error reading event from producer");
                break;
            }
        }

        let payload = trim_line(&line);
        if payload.is_empty() {
            continue;
        }

        match pipeline.ingest(payload).await {
            Ok(()) => ingested += 1,
            Err(IngestError::Invalid(e)) => {
                let excerpt = &payload[..payload.len().min(LOG_EXCERPT_BYTES)];
                warn!(
                    %session,
                    %peer,
                    error = %e,
                    line = %String::from_utf8_lossy(excerpt),
                    "bad event from producer"
                );
                break;
            }
            Err(IngestError::Storage(e)) => {
                // Our fault, not the producer's: keep the session going
                error!(%session, error = %format!("{:#}", e), "failed to store event");
            }
        }
    }

    info!(%session, %peer, ingested, "stream session closed");
}

/// Reads up to and including the next `\n`, refusing lines longer than
/// `max` bytes. Returns 0 at end of stream.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n as u64 == limit && buf.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", max),
        ));
    }
    Ok(n)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymize::{Anonymizer, SecretSeed};
    use crate::enrich::Enricher;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FailingAcceptor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Acceptor for FailingAcceptor {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        }
    }

    #[tokio::test]
    async fn test_accept_errors_back_off_and_still_shut_down() {
        let pipeline = Pipeline::new(
            Anonymizer::new(SecretSeed::new("accept-test")),
            Enricher::default(),
            Arc::new(MemoryStorage::new()),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let acceptor = FailingAcceptor {
            calls: calls.clone(),
        };
        let (shutdown, rx) = watch::channel(false);
        let server = tokio::spawn(accept_loop(acceptor, StreamSettings::default(), pipeline, rx));

        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("accept loop ignored shutdown while backing off")
            .unwrap();

        // Roughly one attempt per backoff period, not a spin
        let attempts = calls.load(Ordering::SeqCst);
        assert!((2..=6).contains(&attempts), "{} accept attempts", attempts);
    }

    #[tokio::test]
    async fn test_read_line_splits_and_reports_eof() {
        let mut reader = BufReader::new(&b"first\nsecond\nlast"[..]);
        let mut buf = Vec::new();

        assert_eq!(read_line(&mut reader, &mut buf, 64).await.unwrap(), 6);
        assert_eq!(trim_line(&buf), b"first");
        buf.clear();
        read_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(trim_line(&buf), b"second");
        buf.clear();
        read_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(trim_line(&buf), b"last");
        buf.clear();
        assert_eq!(read_line(&mut reader, &mut buf, 64).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_line_length_limit() {
        let mut reader = BufReader::new(&b"12345\n123456\n"[..]);
        let mut buf = Vec::new();

        // Exactly `max` bytes plus terminator is allowed
        assert!(read_line(&mut reader, &mut buf, 5).await.is_ok());
        buf.clear();
        let err = read_line(&mut reader, &mut buf, 5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_trim_line_handles_crlf() {
        assert_eq!(trim_line(b"{}\r\n"), b"{}");
        assert_eq!(trim_line(b"{}"), b"{}");
        assert_eq!(trim_line(b"\n"), b"");
    }
}
