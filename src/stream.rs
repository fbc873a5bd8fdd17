//! Stream reader.
//!
//! Wraps one open MJPEG connection. Any failure (read error, timeout,
//! framing error or undecodable JPEG) is reported as `StreamBroken`; the
//! reader never retries and never fabricates a frame.

use crate::endpoint::{CameraEndpoint, TransportKind};
use crate::error::{FailureStage, SourceError};
use crate::frame::Frame;
use crate::ingest::JpegStream;
use crate::probe::OpenStream;

pub struct StreamReader {
    endpoint: CameraEndpoint,
    stream: Box<dyn JpegStream>,
    frames_read: u64,
}

impl StreamReader {
    pub fn new(open: OpenStream) -> Self {
        Self {
            endpoint: open.endpoint,
            stream: open.stream,
            frames_read: 0,
        }
    }

    pub fn endpoint(&self) -> &CameraEndpoint {
        &self.endpoint
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Block until the next frame is decoded or the stream fails.
    pub fn read_frame(&mut self, sequence: u64) -> Result<Frame, SourceError> {
        let jpeg = self
            .stream
            .read_jpeg()
            .map_err(|err| SourceError::stream_broken(&err, FailureStage::Transport))?;
        let frame = Frame::from_jpeg(&jpeg, TransportKind::Stream, sequence)
            .map_err(|err| SourceError::stream_broken(&err, FailureStage::Decode))?;
        self.frames_read += 1;
        Ok(frame)
    }
}
