//! Capture side of Hindsight.
//!
//! [`capture`] wraps an axum application and turns every request/response
//! cycle into a [`RawEvent`]. Events are handed to a [`Recorder`], normally
//! one of the transports, which delivers them to the collector on a best
//! effort, at-most-once basis. Delivery never blocks or fails the request
//! being served; problems are reported through an [`ErrorCallback`].

mod capture;
mod error;
pub mod transport;

pub use capture::{capture, CaptureState, UNKNOWN_IP};
pub use error::{DeliveryError, ErrorCallback};
pub use hindsight::event::RawEvent;
pub use transport::{HttpSettings, HttpTransport, Recorder, StreamSettings, StreamTransport};
