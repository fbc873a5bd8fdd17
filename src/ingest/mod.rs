//! Device transports.
//!
//! The acquisition logic talks to the camera only through these traits:
//! - `CameraTransport`: opens stream connections and snapshot sessions
//! - `JpegStream`: one open MJPEG connection, yielding raw JPEG payloads
//! - `SnapshotSession`: a keep-alive session for single-JPEG fetches
//!
//! `http::HttpTransport` is the production implementation. Transports deal
//! in undecoded JPEG bytes; decoding happens in the reader and poller so a
//! corrupt payload is handled the same way regardless of transport.
//!
//! A transport MUST NOT:
//! - Retry internally (retry policy lives in the controller)
//! - Return a half-open stream (a failed open releases its connection)

pub mod http;
#[cfg(test)]
pub(crate) mod mock;

use anyhow::Result;

use crate::endpoint::CameraEndpoint;

pub use http::{HttpTimeouts, HttpTransport};

/// An open continuous-frame connection.
pub trait JpegStream: Send {
    /// Block until the next complete JPEG payload arrives, or fail.
    fn read_jpeg(&mut self) -> Result<Vec<u8>>;
}

/// A reusable session bound to the snapshot endpoint.
pub trait SnapshotSession: Send {
    /// Perform one fetch and return the whole response body.
    fn fetch_jpeg(&mut self) -> Result<Vec<u8>>;
}

pub trait CameraTransport: Send + Sync {
    /// Open a stream on `endpoint`. On error nothing stays open.
    fn open_stream(&self, endpoint: &CameraEndpoint) -> Result<Box<dyn JpegStream>>;

    /// Create a snapshot session. Does no I/O.
    fn open_session(&self, endpoint: &CameraEndpoint) -> Box<dyn SnapshotSession>;
}
