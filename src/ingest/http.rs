//! HTTP transport for ESP32 cameras.
//!
//! Streams are `multipart/x-mixed-replace` responses carrying one JPEG per
//! part. Snapshots are plain `image/jpeg` responses fetched over a pooled
//! (keep-alive) `ureq::Agent`.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use super::{CameraTransport, JpegStream, SnapshotSession};
use crate::endpoint::CameraEndpoint;
use crate::frame::MAX_JPEG_BYTES;

const READ_CHUNK_BYTES: usize = 8192;
const MAX_PART_HEADER_BYTES: usize = 16 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct HttpTimeouts {
    pub connect: Duration,
    /// Per-read timeout while a stream is open.
    pub stream_read: Duration,
    /// Whole-request timeout for one snapshot.
    pub snapshot: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            stream_read: Duration::from_secs(5),
            snapshot: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    timeouts: HttpTimeouts,
}

impl HttpTransport {
    pub fn new(timeouts: HttpTimeouts) -> Self {
        Self { timeouts }
    }
}

impl CameraTransport for HttpTransport {
    fn open_stream(&self, endpoint: &CameraEndpoint) -> Result<Box<dyn JpegStream>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeouts.connect)
            .timeout_read(self.timeouts.stream_read)
            .build();
        let response = agent
            .get(endpoint.as_str())
            .set("Connection", "keep-alive")
            .call()
            .map_err(|err| describe_http_error(endpoint, err))?;

        let content_type = response.header("Content-Type").unwrap_or("").to_string();
        if !content_type.to_ascii_lowercase().starts_with("multipart/") {
            // Dropping the response closes the connection.
            return Err(anyhow!(
                "{} answered with '{}', not a multipart stream",
                endpoint.as_str(),
                content_type
            ));
        }
        let boundary = parse_boundary(&content_type);
        Ok(Box::new(MjpegStream::new(response.into_reader(), boundary)))
    }

    fn open_session(&self, endpoint: &CameraEndpoint) -> Box<dyn SnapshotSession> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeouts.connect)
            .timeout(self.timeouts.snapshot)
            .build();
        Box::new(HttpSnapshotSession {
            agent,
            endpoint: endpoint.clone(),
        })
    }
}

struct HttpSnapshotSession {
    agent: ureq::Agent,
    endpoint: CameraEndpoint,
}

impl SnapshotSession for HttpSnapshotSession {
    fn fetch_jpeg(&mut self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(self.endpoint.as_str())
            .set("Connection", "keep-alive")
            .call()
            .map_err(|err| describe_http_error(&self.endpoint, err))?;
        let mut bytes = Vec::new();
        // Reading to EOF hands the connection back to the agent's pool.
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(anyhow!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES));
        }
        Ok(bytes)
    }
}

fn describe_http_error(endpoint: &CameraEndpoint, err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, _) => {
            anyhow!("{} returned http status {}", endpoint.as_str(), code)
        }
        ureq::Error::Transport(transport) => {
            anyhow!("connect to {}: {}", endpoint.as_str(), transport)
        }
    }
}

/// Extract the `boundary` parameter from a multipart content type.
pub(crate) fn parse_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    })
}

/// Incremental multipart MJPEG parser over any byte reader.
pub(crate) struct MjpegStream {
    reader: Box<dyn Read + Send>,
    delimiter: Option<Vec<u8>>,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
}

impl MjpegStream {
    pub(crate) fn new(reader: Box<dyn Read + Send>, boundary: Option<String>) -> Self {
        // Some firmwares advertise the boundary with its leading dashes already.
        let delimiter = boundary.map(|b| {
            if b.starts_with("--") {
                b.into_bytes()
            } else {
                format!("--{}", b).into_bytes()
            }
        });
        Self {
            reader,
            delimiter,
            buffer: Vec::with_capacity(64 * 1024),
            chunk: vec![0u8; READ_CHUNK_BYTES],
        }
    }

    fn fill(&mut self) -> Result<()> {
        let read = self.reader.read(&mut self.chunk).context("read mjpeg chunk")?;
        if read == 0 {
            return Err(anyhow!("mjpeg stream ended"));
        }
        self.buffer.extend_from_slice(&self.chunk[..read]);
        Ok(())
    }

    fn read_part(&mut self, delimiter: &[u8]) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find(&self.buffer, delimiter) {
                self.buffer.drain(..pos + delimiter.len());
                break;
            }
            if self.buffer.len() > MAX_JPEG_BYTES {
                return Err(anyhow!("multipart boundary not found"));
            }
            self.fill()?;
        }
        while self.buffer.len() < 2 {
            self.fill()?;
        }
        if self.buffer.starts_with(b"--") {
            return Err(anyhow!("device closed the multipart stream"));
        }

        let headers = loop {
            if let Some(pos) = find(&self.buffer, b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
                self.buffer.drain(..pos + 4);
                break headers;
            }
            if self.buffer.len() > MAX_PART_HEADER_BYTES {
                return Err(anyhow!("multipart part headers too long"));
            }
            self.fill()?;
        };

        let payload = match content_length(&headers) {
            Some(len) if len > MAX_JPEG_BYTES => {
                return Err(anyhow!("multipart part of {} bytes exceeds cap", len))
            }
            Some(len) => {
                while self.buffer.len() < len {
                    self.fill()?;
                }
                self.buffer.drain(..len).collect()
            }
            None => self.scan_jpeg()?,
        };
        if !payload.starts_with(&[0xFF, 0xD8]) {
            return Err(anyhow!("multipart part is not a jpeg"));
        }
        Ok(payload)
    }

    fn scan_jpeg(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }
            if self.buffer.len() > MAX_JPEG_BYTES {
                return Err(anyhow!("no complete jpeg within {} bytes", MAX_JPEG_BYTES));
            }
            self.fill()?;
        }
    }
}

impl JpegStream for MjpegStream {
    fn read_jpeg(&mut self) -> Result<Vec<u8>> {
        match self.delimiter.take() {
            Some(delimiter) => {
                let result = self.read_part(&delimiter);
                self.delimiter = Some(delimiter);
                result
            }
            None => self.scan_jpeg(),
        }
    }
}

fn content_length(headers: &str) -> Option<usize> {
    headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = find(buffer, &[0xFF, 0xD8])?;
    let end = find(&buffer[start + 2..], &[0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
