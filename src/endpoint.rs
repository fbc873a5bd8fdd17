//! Camera endpoints.
//!
//! An endpoint is the camera base address joined with one of the fixed
//! suffixes the ESP32 camera firmware serves: `/stream` on the main port,
//! `:81/stream` on the secondary stream server, and `/capture` for single
//! JPEG snapshots.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use url::Url;

pub const DEFAULT_STREAM_SUFFIXES: [&str; 2] = ["/stream", ":81/stream"];
pub const DEFAULT_SNAPSHOT_SUFFIX: &str = "/capture";

/// Which acquisition mechanism produced (or will produce) a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stream,
    Snapshot,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stream => "stream",
            TransportKind::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable address of one camera endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraEndpoint {
    url: Url,
    kind: TransportKind,
}

impl CameraEndpoint {
    /// Join `suffix` onto `base`.
    ///
    /// A suffix is either a path (`/stream`) appended to the base path, or a
    /// port override followed by a path (`:81/stream`).
    pub fn join(base: &Url, suffix: &str, kind: TransportKind) -> Result<Self> {
        let mut url = base.clone();
        let path = if let Some(rest) = suffix.strip_prefix(':') {
            let (port, path) = match rest.find('/') {
                Some(idx) => rest.split_at(idx),
                None => (rest, ""),
            };
            let port: u16 = port
                .parse()
                .map_err(|_| anyhow!("invalid port in endpoint suffix '{}'", suffix))?;
            url.set_port(Some(port))
                .map_err(|_| anyhow!("cannot set port {} on {}", port, base))?;
            path
        } else if suffix.starts_with('/') {
            suffix
        } else {
            return Err(anyhow!(
                "endpoint suffix '{}' must start with '/' or ':<port>'",
                suffix
            ));
        };

        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };
        let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
        url.set_path(if joined.is_empty() { "/" } else { &joined });
        url.set_query(query);

        Ok(Self { url, kind })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }
}

impl fmt::Display for CameraEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.kind)
    }
}

/// Parse a camera base address such as `http://192.168.0.193/`.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(anyhow!("camera base url must not be empty"));
    }
    let url = Url::parse(trimmed).with_context(|| format!("parse camera base url '{}'", raw))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(anyhow!(
                "unsupported camera url scheme '{}'; expected http(s)",
                other
            ))
        }
    }
    if url.host_str().is_none() {
        return Err(anyhow!("camera base url '{}' has no host", raw));
    }
    Ok(url)
}

/// Stream endpoints in probe priority order.
pub fn stream_endpoints(base: &Url, suffixes: &[String]) -> Result<Vec<CameraEndpoint>> {
    suffixes
        .iter()
        .map(|suffix| CameraEndpoint::join(base, suffix, TransportKind::Stream))
        .collect()
}

pub fn snapshot_endpoint(base: &Url, suffix: &str) -> Result<CameraEndpoint> {
    CameraEndpoint::join(base, suffix, TransportKind::Snapshot)
}
