//! Decoded frames and the consumer-facing result type.
//!
//! - `Frame`: RGB8 pixels plus capture time and the transport that produced it.
//! - `NextFrame`: what a consumer gets back from `FrameSource::next_frame`.
//!
//! A `Frame` is never built from an empty payload. It is not `Clone`: the
//! hand-off slot moves each frame out exactly once.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::time::{Instant, SystemTime};

use crate::endpoint::TransportKind;

/// Upper bound for a single JPEG payload from the camera.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
    /// Monotonic capture instant (for latency and health, not for display).
    capture_instant: Instant,
    pub transport: TransportKind,
    /// Strictly increasing per source.
    pub sequence: u64,
}

impl Frame {
    pub(crate) fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        transport: TransportKind,
        sequence: u64,
    ) -> Result<Self> {
        if pixels.is_empty() || width == 0 || height == 0 {
            return Err(anyhow!("refusing to build an empty frame"));
        }
        if pixels.len() != (width as usize) * (height as usize) * 3 {
            return Err(anyhow!(
                "pixel buffer of {} bytes does not match {}x{} rgb",
                pixels.len(),
                width,
                height
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at: SystemTime::now(),
            capture_instant: Instant::now(),
            transport,
            sequence,
        })
    }

    /// Decode a JPEG payload into a frame.
    pub(crate) fn from_jpeg(jpeg: &[u8], transport: TransportKind, sequence: u64) -> Result<Self> {
        let (pixels, width, height) = decode_jpeg(jpeg)?;
        Self::new(pixels, width, height, transport, sequence)
    }

    /// Packed RGB8 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn age(&self) -> std::time::Duration {
        self.capture_instant.elapsed()
    }

    pub(crate) fn capture_instant(&self) -> Instant {
        self.capture_instant
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("transport", &self.transport)
            .field("sequence", &self.sequence)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Result of one `next_frame` call.
#[derive(Debug)]
pub enum NextFrame {
    /// A newly captured frame, never returned before.
    Frame(Frame),
    /// Nothing new yet; call again shortly.
    Pending,
    /// The source has escalated after repeated failures. It keeps retrying.
    Unavailable,
}

impl NextFrame {
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            NextFrame::Frame(frame) => Some(frame),
            NextFrame::Pending | NextFrame::Unavailable => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, NextFrame::Unavailable)
    }
}

pub(crate) fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg payload"));
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(anyhow!(
            "jpeg payload of {} bytes exceeds {} byte cap",
            bytes.len(),
            MAX_JPEG_BYTES
        ));
    }
    if !bytes.starts_with(&JPEG_SOI) {
        return Err(anyhow!("payload is not a jpeg (missing SOI marker)"));
    }
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}
