//! In-memory camera used by unit tests.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{CameraTransport, JpegStream, SnapshotSession};
use crate::endpoint::CameraEndpoint;
use crate::frame::tests::jpeg_fixture;

#[derive(Debug, Default)]
pub(crate) struct DeviceState {
    pub stream_up: bool,
    pub snapshot_up: bool,
    /// Frames the current stream delivers before it drops.
    pub frames_before_drop: Option<u32>,
    /// Serve undecodable snapshot bodies.
    pub corrupt_snapshots: bool,
    pub stream_opens: u32,
    pub open_attempts: u32,
    pub snapshot_fetches: u32,
    pub sessions_opened: u32,
}

#[derive(Clone, Default)]
pub(crate) struct MockCamera {
    state: Arc<Mutex<DeviceState>>,
}

impl MockCamera {
    pub fn new(stream_up: bool, snapshot_up: bool) -> Self {
        let camera = Self::default();
        {
            let mut state = camera.state();
            state.stream_up = stream_up;
            state.snapshot_up = snapshot_up;
        }
        camera
    }

    pub fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct MockStream {
    state: Arc<Mutex<DeviceState>>,
}

impl JpegStream for MockStream {
    fn read_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.stream_up {
            return Err(anyhow!("connection reset by peer"));
        }
        match state.frames_before_drop {
            Some(0) => {
                state.frames_before_drop = None;
                Err(anyhow!("connection reset mid-read"))
            }
            Some(n) => {
                state.frames_before_drop = Some(n - 1);
                Ok(jpeg_fixture(8, 8, 200))
            }
            None => Ok(jpeg_fixture(8, 8, 200)),
        }
    }
}

struct MockSession {
    state: Arc<Mutex<DeviceState>>,
}

impl SnapshotSession for MockSession {
    fn fetch_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.snapshot_fetches += 1;
        if !state.snapshot_up {
            return Err(anyhow!("connect timed out"));
        }
        if state.corrupt_snapshots {
            return Ok(vec![0xFF, 0xD8, 0xFF]);
        }
        Ok(jpeg_fixture(8, 8, 50))
    }
}

impl CameraTransport for MockCamera {
    fn open_stream(&self, _endpoint: &CameraEndpoint) -> Result<Box<dyn JpegStream>> {
        let mut state = self.state();
        state.open_attempts += 1;
        if !state.stream_up {
            return Err(anyhow!("connection refused"));
        }
        state.stream_opens += 1;
        Ok(Box::new(MockStream {
            state: self.state.clone(),
        }))
    }

    fn open_session(&self, _endpoint: &CameraEndpoint) -> Box<dyn SnapshotSession> {
        self.state().sessions_opened += 1;
        Box::new(MockSession {
            state: self.state.clone(),
        })
    }
}
