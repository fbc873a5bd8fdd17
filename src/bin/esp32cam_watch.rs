//! esp32cam_watch - keep an ESP32-CAM feed alive and report on it.
//!
//! This tool:
//! 1. Probes the camera's MJPEG endpoints (`/stream`, then `:81/stream`)
//! 2. Falls back to polling `/capture` when streaming is unavailable
//! 3. Pulls the latest frame in a consumer loop
//! 4. Logs throughput and source health until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use esp32cam_ingest::{FrameSource, NextFrame, SourceConfig, StopSignal};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Watch an ESP32-CAM feed with stream/snapshot failover"
)]
struct Args {
    /// ESP32-CAM base URL, e.g. http://192.168.0.193
    #[arg(long, env = "ESP32CAM_BASE_URL")]
    ip: Option<String>,

    /// Optional JSON or TOML config file.
    #[arg(long, env = "ESP32CAM_CONFIG")]
    config: Option<PathBuf>,

    /// Stream probe rounds on startup.
    #[arg(long)]
    probe_tries: Option<u32>,

    /// Ceiling on snapshot requests per second while polling.
    #[arg(long)]
    snapshot_rate_hz: Option<f64>,

    /// How long each next-frame call waits before giving up.
    #[arg(long, default_value = "250")]
    poll_timeout_ms: u64,

    /// Seconds between health reports.
    #[arg(long, default_value = "5")]
    report_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = SourceConfig::from_sources(args.config.as_deref())?;
    if let Some(ip) = args.ip {
        cfg.base_url = ip;
    }
    if let Some(tries) = args.probe_tries {
        cfg.probe_tries = tries;
    }
    if let Some(rate) = args.snapshot_rate_hz {
        cfg.snapshot_rate_hz = rate;
    }
    cfg.validate()?;

    let shutdown = StopSignal::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || handler_shutdown.stop()).context("set Ctrl-C handler")?;

    let source = FrameSource::new(cfg)?;
    source.start()?;
    log::info!("esp32cam_watch running against {}", source.config().base_url);

    let poll_timeout = Duration::from_millis(args.poll_timeout_ms.max(1));
    let report_every = Duration::from_secs(args.report_secs.max(1));
    let mut last_report = Instant::now();
    let mut frames_since_report = 0u64;
    let mut was_unavailable = false;

    while !shutdown.is_stopped() {
        match source.next_frame(poll_timeout) {
            NextFrame::Frame(frame) => {
                frames_since_report += 1;
                if was_unavailable {
                    log::info!("camera is back ({})", frame.transport);
                    was_unavailable = false;
                }
                log::debug!(
                    "frame #{} {}x{} via {} age={:?}",
                    frame.sequence,
                    frame.width,
                    frame.height,
                    frame.transport,
                    frame.age()
                );
            }
            NextFrame::Pending => {}
            NextFrame::Unavailable => {
                if !was_unavailable {
                    log::warn!("camera unavailable; still trying to reconnect");
                    was_unavailable = true;
                }
            }
        }

        if last_report.elapsed() >= report_every {
            let status = source.status();
            let stats = source.stats();
            let fps = frames_since_report as f64 / last_report.elapsed().as_secs_f64();
            log::info!(
                "state={} healthy={} fps={:.1} endpoint={} frames(stream={}, snapshot={}) misses={} breaks={} probes={}",
                status.state,
                source.is_healthy(),
                fps,
                status.endpoint.as_deref().unwrap_or("-"),
                stats.frames_stream,
                stats.frames_snapshot,
                stats.snapshot_misses,
                stats.stream_breaks,
                stats.probe_rounds
            );
            if let Some(err) = &status.last_error {
                log::debug!("last error: {}", err);
            }
            frames_since_report = 0;
            last_report = Instant::now();
        }
    }

    log::info!("shutdown signal received, releasing camera connection...");
    source.stop()?;
    Ok(())
}
