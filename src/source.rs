//! Resilient frame source.
//!
//! `FrameSource` runs a `SourceController` on a dedicated acquisition thread.
//! That thread is the only owner of the camera connection and the only
//! writer of the controller state. Consumers read through a single-slot
//! hand-off: each new frame replaces the previous unread one, and
//! `next_frame` moves the frame out so it is never returned twice.

use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::SourceConfig;
use crate::controller::{SourceController, SourceState, SourceStats, SourceStatus};
use crate::frame::{Frame, NextFrame};
use crate::ingest::{CameraTransport, HttpTransport};
use crate::signal::StopSignal;

const STARTUP_GRACE: Duration = Duration::from_secs(5);
const MIN_HEALTH_GRACE: Duration = Duration::from_secs(2);

struct Slot {
    frame: Option<Frame>,
    status: SourceStatus,
    stats: SourceStats,
    /// Highest sequence handed to the slot, kept across restarts.
    last_sequence: u64,
    running: bool,
    started_at: Option<Instant>,
    last_frame_at: Option<Instant>,
}

struct Shared {
    slot: Mutex<Slot>,
    fresh: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Worker {
    stop: StopSignal,
    join: JoinHandle<()>,
}

pub struct FrameSource {
    config: SourceConfig,
    transport: Arc<dyn CameraTransport>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    ever_started: Mutex<bool>,
}

impl FrameSource {
    /// Frame source over HTTP, using the timeouts in `config`.
    pub fn new(config: SourceConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(config.http_timeouts()));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(
        mut config: SourceConfig,
        transport: Arc<dyn CameraTransport>,
    ) -> Result<Self> {
        // Fail on bad settings now rather than on the acquisition thread.
        config.validate()?;
        Ok(Self {
            config,
            transport,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    frame: None,
                    status: SourceStatus::disconnected(),
                    stats: SourceStats::default(),
                    last_sequence: 0,
                    running: false,
                    started_at: None,
                    last_frame_at: None,
                }),
                fresh: Condvar::new(),
            }),
            worker: Mutex::new(None),
            ever_started: Mutex::new(false),
        })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Start acquiring. Always begins with a fresh probe; no-op if running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = worker.as_ref() {
            if !existing.join.is_finished() {
                return Ok(());
            }
            if let Some(dead) = worker.take() {
                if dead.join.join().is_err() {
                    log::warn!("acquisition thread had panicked; restarting it");
                }
            }
        }
        *self.ever_started.lock().unwrap_or_else(|e| e.into_inner()) = true;

        let mut controller = SourceController::new(&self.config, self.transport.clone())?;
        {
            let mut slot = self.shared.lock();
            controller.resume(slot.last_sequence + 1, slot.stats.clone());
            controller.start();
            slot.frame = None;
            slot.status = controller.status();
            slot.running = true;
            slot.started_at = Some(Instant::now());
            slot.last_frame_at = None;
        }

        let stop = StopSignal::new();
        let thread_stop = stop.clone();
        let shared = self.shared.clone();
        let join = std::thread::Builder::new()
            .name("esp32cam-acquire".to_string())
            .spawn(move || run_acquisition(controller, shared, thread_stop))
            .context("spawn acquisition thread")?;
        log::info!("frame source started for {}", self.config.base_url);
        *worker = Some(Worker { stop, join });
        Ok(())
    }

    /// Stop acquiring and release the camera connection. The loop exits
    /// after its current iteration, which a blocked stream read bounds by
    /// the stream read timeout.
    pub fn stop(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(worker) = worker else {
            return Ok(());
        };
        worker.stop.stop();
        let joined = worker.join.join();
        {
            let mut slot = self.shared.lock();
            slot.frame = None;
            slot.running = false;
            slot.status = SourceStatus::disconnected();
        }
        self.shared.fresh.notify_all();
        joined.map_err(|_| anyhow!("acquisition thread panicked"))?;
        log::info!("frame source stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Wait up to `timeout` for a frame captured since the last call.
    ///
    /// The first call on a never-started source starts it.
    pub fn next_frame(&self, timeout: Duration) -> NextFrame {
        let needs_start = !*self.ever_started.lock().unwrap_or_else(|e| e.into_inner());
        if needs_start {
            if let Err(err) = self.start() {
                log::error!("frame source failed to start: {:#}", err);
                return NextFrame::Unavailable;
            }
        }

        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.lock();
        loop {
            if let Some(frame) = slot.frame.take() {
                return NextFrame::Frame(frame);
            }
            let now = Instant::now();
            if !slot.running || now >= deadline {
                break;
            }
            slot = self
                .shared
                .fresh
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if slot.status.unavailable {
            NextFrame::Unavailable
        } else {
            NextFrame::Pending
        }
    }

    pub fn state(&self) -> SourceState {
        self.shared.lock().status.state
    }

    pub fn status(&self) -> SourceStatus {
        self.shared.lock().status.clone()
    }

    pub fn stats(&self) -> SourceStats {
        self.shared.lock().stats.clone()
    }

    /// Running, not escalated, and producing frames recently.
    pub fn is_healthy(&self) -> bool {
        let slot = self.shared.lock();
        if !slot.running || slot.status.unavailable {
            return false;
        }
        match (slot.last_frame_at, slot.started_at) {
            (Some(last), _) => last.elapsed() <= self.health_grace(),
            (None, Some(started)) => started.elapsed() <= STARTUP_GRACE,
            (None, None) => false,
        }
    }

    fn health_grace(&self) -> Duration {
        let frame_interval = Duration::from_secs_f64(1.0 / self.config.snapshot_rate_hz.max(0.1));
        (frame_interval * 6).max(MIN_HEALTH_GRACE)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("frame source did not stop cleanly: {:#}", err);
        }
    }
}

/// Marks the source as no longer running when the acquisition thread exits,
/// including by panic, so consumers stop waiting on it.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.lock().running = false;
        self.0.fresh.notify_all();
    }
}

fn run_acquisition(mut controller: SourceController, shared: Arc<Shared>, stop: StopSignal) {
    let _exit = ExitGuard(shared.clone());
    while !stop.is_stopped() {
        let frame = controller.step(&stop);
        {
            let mut slot = shared.lock();
            if let Some(frame) = frame {
                slot.last_frame_at = Some(frame.capture_instant());
                slot.last_sequence = frame.sequence;
                // An unread older frame is dropped here.
                slot.frame = Some(frame);
            }
            slot.status = controller.status();
            slot.stats = controller.stats().clone();
        }
        shared.fresh.notify_all();
    }
    controller.stop();
}
