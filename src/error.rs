//! Failure taxonomy for the frame source.
//!
//! Only `ProbeExhausted` and `StreamBroken` drive state transitions. A
//! `SnapshotMiss` is absorbed by the poller, and `SourceUnavailable` is a
//! status surfaced to the consumer rather than a fault. None of them stop
//! the acquisition loop.

use std::fmt;

use crate::endpoint::TransportKind;

/// Where a per-frame failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureStage {
    /// Connecting, reading or framing.
    Transport,
    /// The payload arrived but was not a usable JPEG.
    Decode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceError {
    /// No stream endpoint opened within the probe budget.
    ProbeExhausted { tries: u32 },
    /// Mid-stream read, framing or decode failure.
    StreamBroken { reason: String, stage: FailureStage },
    /// A single snapshot fetch or decode failed.
    SnapshotMiss { reason: String, stage: FailureStage },
    /// Consecutive failures crossed the escalation threshold.
    SourceUnavailable { consecutive_failures: u32 },
}

impl SourceError {
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::ProbeExhausted { .. } => "PROBE_EXHAUSTED",
            SourceError::StreamBroken { .. } => "STREAM_BROKEN",
            SourceError::SnapshotMiss { .. } => "SNAPSHOT_MISS",
            SourceError::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
        }
    }

    /// Transport the failure belongs to, if any.
    pub fn transport(&self) -> Option<TransportKind> {
        match self {
            SourceError::ProbeExhausted { .. } | SourceError::StreamBroken { .. } => {
                Some(TransportKind::Stream)
            }
            SourceError::SnapshotMiss { .. } => Some(TransportKind::Snapshot),
            SourceError::SourceUnavailable { .. } => None,
        }
    }

    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            SourceError::StreamBroken {
                stage: FailureStage::Decode,
                ..
            } | SourceError::SnapshotMiss {
                stage: FailureStage::Decode,
                ..
            }
        )
    }

    pub(crate) fn stream_broken(err: &anyhow::Error, stage: FailureStage) -> Self {
        SourceError::StreamBroken {
            reason: format!("{:#}", err),
            stage,
        }
    }

    pub(crate) fn snapshot_miss(err: &anyhow::Error, stage: FailureStage) -> Self {
        SourceError::SnapshotMiss {
            reason: format!("{:#}", err),
            stage,
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::ProbeExhausted { tries } => write!(
                f,
                "{}: no stream endpoint reachable after {} tries",
                self.code(),
                tries
            ),
            SourceError::StreamBroken { reason, .. } | SourceError::SnapshotMiss { reason, .. } => {
                write!(f, "{}: {}", self.code(), reason)
            }
            SourceError::SourceUnavailable {
                consecutive_failures,
            } => write!(
                f,
                "{}: {} consecutive failures",
                self.code(),
                consecutive_failures
            ),
        }
    }
}

impl std::error::Error for SourceError {}
