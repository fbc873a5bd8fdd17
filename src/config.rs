use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::endpoint::{
    parse_base_url, snapshot_endpoint, stream_endpoints, CameraEndpoint, DEFAULT_SNAPSHOT_SUFFIX,
    DEFAULT_STREAM_SUFFIXES,
};
use crate::ingest::HttpTimeouts;

const DEFAULT_PROBE_TRIES: u32 = 3;
const DEFAULT_RECONNECT_TRIES: u32 = 2;
const DEFAULT_PROBE_BACKOFF_MS: u64 = 1_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_STREAM_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SNAPSHOT_RATE_HZ: f64 = 30.0;
const DEFAULT_SNAPSHOT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_STREAM_REPROBE_MS: u64 = 30_000;
const DEFAULT_ESCALATION_THRESHOLD: u32 = 3;
/// One snapshot every 100s is the slowest cadence accepted.
pub const MIN_SNAPSHOT_RATE_HZ: f64 = 0.01;

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    base_url: Option<String>,
    escalation_threshold: Option<u32>,
    probe: Option<ProbeConfigFile>,
    stream: Option<StreamConfigFile>,
    snapshot: Option<SnapshotConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ProbeConfigFile {
    tries: Option<u32>,
    reconnect_tries: Option<u32>,
    backoff_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    suffixes: Option<Vec<String>>,
    read_timeout_ms: Option<u64>,
    reprobe_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    suffix: Option<String>,
    rate_hz: Option<f64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Camera base address, e.g. `http://192.168.0.193`.
    pub base_url: String,
    /// Stream suffixes in probe priority order.
    pub stream_suffixes: Vec<String>,
    pub snapshot_suffix: String,
    /// Probe rounds on startup.
    pub probe_tries: u32,
    /// Probe rounds after a stream breaks.
    pub reconnect_tries: u32,
    pub probe_backoff: Duration,
    pub connect_timeout: Duration,
    pub stream_read_timeout: Duration,
    /// Ceiling on snapshot requests per second.
    pub snapshot_rate_hz: f64,
    pub snapshot_timeout: Duration,
    /// How often to re-try the stream while polling snapshots. `None` disables.
    pub stream_reprobe_interval: Option<Duration>,
    /// Consecutive failures before the source reports itself unavailable.
    pub escalation_threshold: u32,
}

impl SourceConfig {
    /// Defaults for `base_url`; does not validate.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stream_suffixes: DEFAULT_STREAM_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            snapshot_suffix: DEFAULT_SNAPSHOT_SUFFIX.to_string(),
            probe_tries: DEFAULT_PROBE_TRIES,
            reconnect_tries: DEFAULT_RECONNECT_TRIES,
            probe_backoff: Duration::from_millis(DEFAULT_PROBE_BACKOFF_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            stream_read_timeout: Duration::from_millis(DEFAULT_STREAM_READ_TIMEOUT_MS),
            snapshot_rate_hz: DEFAULT_SNAPSHOT_RATE_HZ,
            snapshot_timeout: Duration::from_millis(DEFAULT_SNAPSHOT_TIMEOUT_MS),
            stream_reprobe_interval: Some(Duration::from_millis(DEFAULT_STREAM_REPROBE_MS)),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
        }
    }

    /// Load from `ESP32CAM_CONFIG` (if set) and env overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ESP32CAM_CONFIG").ok();
        let mut cfg = Self::from_sources(config_path.as_deref().map(Path::new))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read an optional config file and apply env overrides without
    /// validating, so callers can layer their own overrides first.
    pub fn from_sources(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SourceConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: SourceConfigFile) -> Self {
        let mut cfg = Self::new(file.base_url.unwrap_or_default());
        if let Some(threshold) = file.escalation_threshold {
            cfg.escalation_threshold = threshold;
        }
        if let Some(probe) = file.probe {
            cfg.probe_tries = probe.tries.unwrap_or(cfg.probe_tries);
            cfg.reconnect_tries = probe.reconnect_tries.unwrap_or(cfg.reconnect_tries);
            if let Some(ms) = probe.backoff_ms {
                cfg.probe_backoff = Duration::from_millis(ms);
            }
            if let Some(ms) = probe.connect_timeout_ms {
                cfg.connect_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(stream) = file.stream {
            if let Some(suffixes) = stream.suffixes {
                cfg.stream_suffixes = suffixes;
            }
            if let Some(ms) = stream.read_timeout_ms {
                cfg.stream_read_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = stream.reprobe_interval_ms {
                cfg.stream_reprobe_interval = reprobe_from_ms(ms);
            }
        }
        if let Some(snapshot) = file.snapshot {
            if let Some(suffix) = snapshot.suffix {
                cfg.snapshot_suffix = suffix;
            }
            cfg.snapshot_rate_hz = snapshot.rate_hz.unwrap_or(cfg.snapshot_rate_hz);
            if let Some(ms) = snapshot.timeout_ms {
                cfg.snapshot_timeout = Duration::from_millis(ms);
            }
        }
        cfg
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("ESP32CAM_BASE_URL") {
            if !url.trim().is_empty() {
                self.base_url = url;
            }
        }
        if let Ok(suffixes) = std::env::var("ESP32CAM_STREAM_SUFFIXES") {
            let parsed = split_csv(&suffixes);
            if !parsed.is_empty() {
                self.stream_suffixes = parsed;
            }
        }
        if let Ok(suffix) = std::env::var("ESP32CAM_SNAPSHOT_SUFFIX") {
            if !suffix.trim().is_empty() {
                self.snapshot_suffix = suffix.trim().to_string();
            }
        }
        if let Some(tries) = env_number("ESP32CAM_PROBE_TRIES")? {
            self.probe_tries = tries;
        }
        if let Some(tries) = env_number("ESP32CAM_RECONNECT_TRIES")? {
            self.reconnect_tries = tries;
        }
        if let Some(ms) = env_number("ESP32CAM_PROBE_BACKOFF_MS")? {
            self.probe_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("ESP32CAM_STREAM_READ_TIMEOUT_MS")? {
            self.stream_read_timeout = Duration::from_millis(ms);
        }
        if let Some(rate) = env_number("ESP32CAM_SNAPSHOT_RATE_HZ")? {
            self.snapshot_rate_hz = rate;
        }
        if let Some(ms) = env_number("ESP32CAM_SNAPSHOT_TIMEOUT_MS")? {
            self.snapshot_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("ESP32CAM_STREAM_REPROBE_MS")? {
            self.stream_reprobe_interval = reprobe_from_ms(ms);
        }
        if let Some(threshold) = env_number("ESP32CAM_ESCALATION_THRESHOLD")? {
            self.escalation_threshold = threshold;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(anyhow!(
                "camera base url is required (set base_url or ESP32CAM_BASE_URL)"
            ));
        }
        let base = parse_base_url(&self.base_url)?;
        self.base_url = base.as_str().trim_end_matches('/').to_string();

        if self.stream_suffixes.is_empty() {
            return Err(anyhow!("at least one stream suffix is required"));
        }
        self.endpoints()?;

        if self.probe_tries == 0 || self.reconnect_tries == 0 {
            return Err(anyhow!("probe and reconnect tries must be at least 1"));
        }
        let rate = self.snapshot_rate_hz;
        if !(rate.is_finite() && rate >= MIN_SNAPSHOT_RATE_HZ) {
            return Err(anyhow!(
                "snapshot rate must be a number of hz no lower than {}",
                MIN_SNAPSHOT_RATE_HZ
            ));
        }
        if self.connect_timeout.is_zero()
            || self.stream_read_timeout.is_zero()
            || self.snapshot_timeout.is_zero()
        {
            return Err(anyhow!("timeouts must be greater than zero"));
        }
        if self.escalation_threshold == 0 {
            return Err(anyhow!("escalation threshold must be at least 1"));
        }
        Ok(())
    }

    /// Stream endpoints in priority order, and the snapshot endpoint.
    pub fn endpoints(&self) -> Result<(Vec<CameraEndpoint>, CameraEndpoint)> {
        let base = parse_base_url(&self.base_url)?;
        let streams = stream_endpoints(&base, &self.stream_suffixes)?;
        let snapshot = snapshot_endpoint(&base, &self.snapshot_suffix)?;
        Ok((streams, snapshot))
    }

    pub fn http_timeouts(&self) -> HttpTimeouts {
        HttpTimeouts {
            connect: self.connect_timeout,
            stream_read: self.stream_read_timeout,
            snapshot: self.snapshot_timeout,
        }
    }
}

fn reprobe_from_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number", key)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<SourceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
