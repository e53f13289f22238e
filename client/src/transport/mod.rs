//! Delivery of captured events to the collector.

use hindsight::event::RawEvent;
use std::sync::Arc;

mod http;
mod stream;

pub use http::{HttpSettings, HttpTransport};
pub use stream::{Connection, Dialer, StreamSettings, StreamTransport, TcpDialer};

/// Accepts finished events for delivery.
///
/// Called on the request path, so implementations must hand the event off
/// without waiting on the network.
pub trait Recorder: Send + Sync {
    fn record(&self, event: RawEvent);
}

impl<R: Recorder + ?Sized> Recorder for Arc<R> {
    fn record(&self, event: RawEvent) {
        (**self).record(event)
    }
}

/// Serializes events as NDJSON, one line each.
pub(crate) fn encode_lines(events: &[RawEvent]) -> Result<Vec<u8>, crate::DeliveryError> {
    let mut out = Vec::with_capacity(events.len() * 256);
    for event in events {
        serde_json::to_writer(&mut out, event)
            .map_err(|e| crate::DeliveryError::Encode(e.to_string()))?;
        out.push(b'\n');
    }
    Ok(out)
}
