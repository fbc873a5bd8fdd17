//! ESP32-CAM frame acquisition.
//!
//! This crate keeps a downstream consumer fed with decoded frames from an
//! ESP32-class camera over an unreliable local network.
//!
//! # Architecture
//!
//! - `probe`: finds a reachable MJPEG stream endpoint with bounded retries
//! - `stream`: reads frames from one open MJPEG connection
//! - `snapshot`: polls `/capture` on a paced, keep-alive session
//! - `controller`: the state machine that owns exactly one of the above
//! - `source`: runs the controller on its own thread behind `next_frame`
//!
//! Device I/O goes through the `ingest::CameraTransport` trait;
//! `ingest::HttpTransport` is the production implementation.
//!
//! The acquisition layer MUST NOT:
//! - Buffer more than the latest unread frame
//! - Hand out the same frame twice
//! - Give up on the camera after repeated failures

pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod probe;
pub mod signal;
pub mod snapshot;
pub mod source;
pub mod stream;

pub use config::SourceConfig;
pub use controller::{
    ControllerSettings, RetryBudget, SourceController, SourceState, SourceStats, SourceStatus,
};
pub use endpoint::{CameraEndpoint, TransportKind};
pub use error::{FailureStage, SourceError};
pub use frame::{Frame, NextFrame, MAX_JPEG_BYTES};
pub use ingest::{CameraTransport, HttpTimeouts, HttpTransport, JpegStream, SnapshotSession};
pub use probe::{OpenStream, ProbeOutcome, TransportProbe};
pub use signal::StopSignal;
pub use snapshot::{Grab, Pacer, SnapshotPoller};
pub use source::FrameSource;
pub use stream::StreamReader;
