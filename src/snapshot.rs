//! Snapshot poller.
//!
//! Fetches one JPEG per request over a keep-alive session, paced so that
//! request starts are never closer together than the configured interval,
//! whether the previous fetch succeeded or not. A failed fetch or decode is
//! a `SnapshotMiss`, returned as a value for the caller to count and move on.

use std::time::{Duration, Instant};

use crate::endpoint::{CameraEndpoint, TransportKind};
use crate::error::{FailureStage, SourceError};
use crate::frame::Frame;
use crate::ingest::SnapshotSession;
use crate::signal::StopSignal;

/// Longest spacing a pacer will impose, whatever rate it is given.
const MAX_PACING_INTERVAL: Duration = Duration::from_secs(100);

/// Minimum spacing between request starts.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_start: Option<Instant>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: None,
        }
    }

    pub fn from_rate_hz(rate_hz: f64) -> Self {
        let min_interval = if rate_hz > 0.0 && rate_hz.is_finite() {
            Duration::try_from_secs_f64(1.0 / rate_hz)
                .unwrap_or(MAX_PACING_INTERVAL)
                .min(MAX_PACING_INTERVAL)
        } else {
            Duration::ZERO
        };
        Self::new(min_interval)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next request may start, then mark it started.
    /// Returns `false` if stopped while waiting.
    pub fn wait_turn(&mut self, stop: &StopSignal) -> bool {
        if let Some(last) = self.last_start {
            let since = last.elapsed();
            if since < self.min_interval && !stop.sleep(self.min_interval - since) {
                return false;
            }
        }
        self.last_start = Some(Instant::now());
        true
    }
}

pub enum Grab {
    Frame(Frame),
    Miss(SourceError),
    Stopped,
}

pub struct SnapshotPoller {
    endpoint: CameraEndpoint,
    session: Box<dyn SnapshotSession>,
    pacer: Pacer,
    misses: u64,
}

impl SnapshotPoller {
    pub fn new(endpoint: CameraEndpoint, session: Box<dyn SnapshotSession>, pacer: Pacer) -> Self {
        Self {
            endpoint,
            session,
            pacer,
            misses: 0,
        }
    }

    pub fn endpoint(&self) -> &CameraEndpoint {
        &self.endpoint
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Grab one frame, waiting for the pacing slot first.
    pub fn grab(&mut self, sequence: u64, stop: &StopSignal) -> Grab {
        if !self.pacer.wait_turn(stop) {
            return Grab::Stopped;
        }
        let result = match self.session.fetch_jpeg() {
            Ok(jpeg) => Frame::from_jpeg(&jpeg, TransportKind::Snapshot, sequence)
                .map_err(|err| SourceError::snapshot_miss(&err, FailureStage::Decode)),
            Err(err) => Err(SourceError::snapshot_miss(&err, FailureStage::Transport)),
        };
        match result {
            Ok(frame) => Grab::Frame(frame),
            Err(miss) => {
                self.misses += 1;
                log::debug!("{} from {}", miss, self.endpoint.as_str());
                Grab::Miss(miss)
            }
        }
    }
}
