//! Source controller.
//!
//! Owns exactly one active transport and moves between them:
//!
//! ```text
//! Disconnected --start--> Reconnecting --probe ok--------> StreamActive
//!                              |   ^                            |
//!                              |   +------ stream broken -------+
//!                              +--probe exhausted--> SnapshotActive --reprobe ok--> StreamActive
//! any state --stop--> Disconnected
//! ```
//!
//! The controller is driven one `step()` at a time by a single acquisition
//! loop, which is the only writer of its state. Failures never end the loop:
//! consecutive failures past the escalation threshold only flip the status
//! to unavailable until the next frame arrives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::SourceConfig;
use crate::endpoint::{CameraEndpoint, TransportKind};
use crate::error::SourceError;
use crate::frame::Frame;
use crate::ingest::CameraTransport;
use crate::probe::{ProbeOutcome, TransportProbe};
use crate::signal::StopSignal;
use crate::snapshot::{Grab, Pacer, SnapshotPoller};
use crate::stream::StreamReader;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceState {
    Disconnected,
    Reconnecting,
    StreamActive,
    SnapshotActive,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Disconnected => "disconnected",
            SourceState::Reconnecting => "reconnecting",
            SourceState::StreamActive => "stream_active",
            SourceState::SnapshotActive => "snapshot_active",
        }
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded probe attempts with a fixed inter-attempt delay.
///
/// Reset whenever a transport delivers a frame; an opened stream that breaks
/// before delivering anything keeps its attempt spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    max_attempts: u32,
    delay: Duration,
    used: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            used: 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn consume(&mut self, attempts: u32) {
        self.used = self.used.saturating_add(attempts).min(self.max_attempts);
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Longest time an exhausting probe can spend in backoff.
    pub fn worst_case_backoff(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_stream: u64,
    pub frames_snapshot: u64,
    pub snapshot_misses: u64,
    pub stream_breaks: u64,
    pub probe_rounds: u64,
    pub decode_failures: u64,
}

impl SourceStats {
    pub fn frames_total(&self) -> u64 {
        self.frames_stream + self.frames_snapshot
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStatus {
    pub state: SourceState,
    /// Escalated after `escalation_threshold` consecutive failures.
    pub unavailable: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<SourceError>,
    /// Endpoint the active transport is bound to.
    pub endpoint: Option<String>,
}

impl SourceStatus {
    pub fn disconnected() -> Self {
        Self {
            state: SourceState::Disconnected,
            unavailable: false,
            consecutive_failures: 0,
            last_error: None,
            endpoint: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub probe_tries: u32,
    pub reconnect_tries: u32,
    pub probe_backoff: Duration,
    pub snapshot_rate_hz: f64,
    pub stream_reprobe_interval: Option<Duration>,
    pub escalation_threshold: u32,
}

impl From<&SourceConfig> for ControllerSettings {
    fn from(cfg: &SourceConfig) -> Self {
        Self {
            probe_tries: cfg.probe_tries,
            reconnect_tries: cfg.reconnect_tries,
            probe_backoff: cfg.probe_backoff,
            snapshot_rate_hz: cfg.snapshot_rate_hz,
            stream_reprobe_interval: cfg.stream_reprobe_interval,
            escalation_threshold: cfg.escalation_threshold.max(1),
        }
    }
}

/// The single live transport, if any. Holding the reader or poller here is
/// what makes "at most one active transport" hold by construction.
enum Link {
    Disconnected,
    Reconnecting,
    Stream(StreamReader),
    Snapshot(SnapshotPoller),
}

pub struct SourceController {
    transport: Arc<dyn CameraTransport>,
    probe: TransportProbe,
    snapshot_endpoint: CameraEndpoint,
    settings: ControllerSettings,
    link: Link,
    budget: RetryBudget,
    next_sequence: u64,
    consecutive_failures: u32,
    last_error: Option<SourceError>,
    last_reprobe: Option<Instant>,
    escalated: bool,
    stats: SourceStats,
}

impl SourceController {
    pub fn new(cfg: &SourceConfig, transport: Arc<dyn CameraTransport>) -> Result<Self> {
        let (streams, snapshot) = cfg.endpoints()?;
        Ok(Self::with_endpoints(
            streams,
            snapshot,
            ControllerSettings::from(cfg),
            transport,
        ))
    }

    pub fn with_endpoints(
        stream_endpoints: Vec<CameraEndpoint>,
        snapshot_endpoint: CameraEndpoint,
        settings: ControllerSettings,
        transport: Arc<dyn CameraTransport>,
    ) -> Self {
        let probe = TransportProbe::new(stream_endpoints, settings.probe_backoff);
        let budget = RetryBudget::new(settings.probe_tries, settings.probe_backoff);
        Self {
            transport,
            probe,
            snapshot_endpoint,
            settings,
            link: Link::Disconnected,
            budget,
            next_sequence: 1,
            consecutive_failures: 0,
            last_error: None,
            last_reprobe: None,
            escalated: false,
            stats: SourceStats::default(),
        }
    }

    pub fn state(&self) -> SourceState {
        match self.link {
            Link::Disconnected => SourceState::Disconnected,
            Link::Reconnecting => SourceState::Reconnecting,
            Link::Stream(_) => SourceState::StreamActive,
            Link::Snapshot(_) => SourceState::SnapshotActive,
        }
    }

    pub fn status(&self) -> SourceStatus {
        let endpoint = match &self.link {
            Link::Stream(reader) => Some(reader.endpoint().as_str().to_string()),
            Link::Snapshot(poller) => Some(poller.endpoint().as_str().to_string()),
            Link::Disconnected | Link::Reconnecting => None,
        };
        SourceStatus {
            state: self.state(),
            unavailable: self.is_unavailable(),
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            endpoint,
        }
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    pub fn is_unavailable(&self) -> bool {
        self.consecutive_failures >= self.settings.escalation_threshold
    }

    /// Continue sequence numbers and lifetime stats from an earlier run.
    pub fn resume(&mut self, next_sequence: u64, stats: SourceStats) {
        self.next_sequence = next_sequence.max(1);
        self.stats = stats;
    }

    /// `Disconnected -> Reconnecting` with a fresh startup budget.
    pub fn start(&mut self) {
        if matches!(self.link, Link::Disconnected) {
            self.budget = RetryBudget::new(self.settings.probe_tries, self.settings.probe_backoff);
            self.transition(Link::Reconnecting);
        }
    }

    /// Release whatever transport is live and go to `Disconnected`.
    pub fn stop(&mut self) {
        self.transition(Link::Disconnected);
        self.last_reprobe = None;
    }

    /// Run one iteration of the active transport. Returns a frame when one
    /// was captured during this step.
    pub fn step(&mut self, stop: &StopSignal) -> Option<Frame> {
        if stop.is_stopped() {
            return None;
        }
        match self.link {
            Link::Disconnected => None,
            Link::Reconnecting => {
                self.reconnect(stop);
                None
            }
            Link::Stream(_) => self.step_stream(),
            Link::Snapshot(_) => self.step_snapshot(stop),
        }
    }

    fn reconnect(&mut self, stop: &StopSignal) {
        let tries = self.budget.remaining();
        if tries == 0 {
            self.enter_snapshot();
            return;
        }
        match self.probe.run(self.transport.as_ref(), tries, stop) {
            ProbeOutcome::Opened {
                stream,
                failed_rounds,
            } => {
                self.stats.probe_rounds += u64::from(failed_rounds) + 1;
                self.budget.consume(failed_rounds + 1);
                self.record_failures(failed_rounds);
                self.transition(Link::Stream(StreamReader::new(stream)));
            }
            ProbeOutcome::Exhausted { rounds } => {
                self.stats.probe_rounds += u64::from(rounds);
                self.budget.consume(rounds);
                self.last_error = Some(SourceError::ProbeExhausted { tries: rounds });
                self.record_failures(rounds);
                log::warn!(
                    "no stream endpoint after {} tries; falling back to snapshot polling",
                    rounds
                );
                self.enter_snapshot();
            }
            ProbeOutcome::Cancelled => {}
        }
    }

    fn step_stream(&mut self) -> Option<Frame> {
        let Link::Stream(reader) = &mut self.link else {
            return None;
        };
        match reader.read_frame(self.next_sequence) {
            Ok(frame) => Some(self.deliver(frame)),
            Err(broken) => {
                let delivered = reader.frames_read() > 0;
                log::warn!("{} on {}; reconnecting", broken, reader.endpoint().as_str());
                self.stats.stream_breaks += 1;
                if broken.is_decode_failure() {
                    self.stats.decode_failures += 1;
                }
                self.last_error = Some(broken);
                self.record_failures(1);
                // Release the broken handle before probing again.
                self.transition(Link::Reconnecting);
                if delivered {
                    self.budget = self.reconnect_budget();
                } else if self.budget.is_exhausted() {
                    self.enter_snapshot();
                }
                None
            }
        }
    }

    fn step_snapshot(&mut self, stop: &StopSignal) -> Option<Frame> {
        if self.reprobe_due() {
            self.last_reprobe = Some(Instant::now());
            self.stats.probe_rounds += 1;
            if let ProbeOutcome::Opened { stream, .. } =
                self.probe.run(self.transport.as_ref(), 1, stop)
            {
                log::info!("stream endpoint is back; leaving snapshot polling");
                self.budget = self.reconnect_budget();
                self.budget.consume(1);
                self.transition(Link::Stream(StreamReader::new(stream)));
                return None;
            }
        }

        let Link::Snapshot(poller) = &mut self.link else {
            return None;
        };
        match poller.grab(self.next_sequence, stop) {
            Grab::Frame(frame) => Some(self.deliver(frame)),
            Grab::Miss(miss) => {
                self.stats.snapshot_misses += 1;
                if miss.is_decode_failure() {
                    self.stats.decode_failures += 1;
                }
                self.last_error = Some(miss);
                self.record_failures(1);
                None
            }
            Grab::Stopped => None,
        }
    }

    fn reprobe_due(&self) -> bool {
        match (self.settings.stream_reprobe_interval, self.last_reprobe) {
            (Some(interval), Some(last)) => last.elapsed() >= interval,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn reconnect_budget(&self) -> RetryBudget {
        RetryBudget::new(self.settings.reconnect_tries, self.settings.probe_backoff)
    }

    fn enter_snapshot(&mut self) {
        let session = self.transport.open_session(&self.snapshot_endpoint);
        let poller = SnapshotPoller::new(
            self.snapshot_endpoint.clone(),
            session,
            Pacer::from_rate_hz(self.settings.snapshot_rate_hz),
        );
        self.last_reprobe = Some(Instant::now());
        self.transition(Link::Snapshot(poller));
    }

    fn deliver(&mut self, frame: Frame) -> Frame {
        match frame.transport {
            TransportKind::Stream => self.stats.frames_stream += 1,
            TransportKind::Snapshot => self.stats.frames_snapshot += 1,
        }
        if self.escalated {
            log::info!(
                "camera recovered on {} after {} consecutive failures",
                frame.transport,
                self.consecutive_failures
            );
            self.escalated = false;
        }
        self.consecutive_failures = 0;
        if frame.transport == TransportKind::Stream {
            self.budget = self.reconnect_budget();
        }
        self.next_sequence += 1;
        frame
    }

    fn record_failures(&mut self, count: u32) {
        if count == 0 {
            return;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(count);
        if self.is_unavailable() && !self.escalated {
            self.escalated = true;
            log::warn!(
                "{}; still retrying",
                SourceError::SourceUnavailable {
                    consecutive_failures: self.consecutive_failures
                }
            );
        }
    }

    fn transition(&mut self, next: Link) {
        let from = self.state();
        // The previous transport is dropped here, closing its connection.
        self.link = next;
        let to = self.state();
        if from != to {
            log::info!("frame source {} -> {}", from, to);
        }
    }
}
