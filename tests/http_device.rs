//! End-to-end checks against a fake ESP32-CAM HTTP server.
//!
//! The fake device speaks just enough HTTP/1.1 to look like the stock
//! CameraWebServer firmware: `/stream` answers with a
//! `multipart/x-mixed-replace` body and `/capture` answers with one JPEG
//! per request on a keep-alive connection.

use std::io::{BufRead, BufReader, Cursor, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use esp32cam_ingest::{Frame, FrameSource, NextFrame, SourceConfig, SourceState, TransportKind};

const BOUNDARY: &str = "123456789000000000000987654321";
const FRAME_WIDTH: u32 = 32;
const FRAME_HEIGHT: u32 = 24;

#[derive(Default)]
struct DeviceState {
    stream_up: bool,
    snapshot_up: bool,
    /// Close each stream connection after this many parts.
    frames_per_connection: Option<u32>,
    stream_connections: u32,
    capture_connections: u32,
    captures_served: u32,
}

struct FakeEsp32 {
    port: u16,
    state: Arc<Mutex<DeviceState>>,
}

impl FakeEsp32 {
    fn spawn(stream_up: bool, snapshot_up: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake camera");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(DeviceState {
            stream_up,
            snapshot_up,
            ..DeviceState::default()
        }));
        let accept_state = state.clone();
        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else { continue };
                let state = accept_state.clone();
                thread::spawn(move || serve_connection(conn, state));
            }
        });
        Self { port, state }
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }
}

fn jpeg(shade: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, image::Rgb([shade, 64, 200]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .expect("encode jpeg");
    bytes
}

fn read_request_path(reader: &mut BufReader<TcpStream>) -> Option<String> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).ok()? == 0 {
        return None;
    }
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    request_line.split_whitespace().nth(1).map(str::to_string)
}

fn serve_connection(conn: TcpStream, state: Arc<Mutex<DeviceState>>) {
    let _ = conn.set_read_timeout(Some(Duration::from_secs(5)));
    let Ok(mut writer) = conn.try_clone() else { return };
    let mut reader = BufReader::new(conn);
    let mut counted_capture = false;

    while let Some(path) = read_request_path(&mut reader) {
        match path.as_str() {
            "/stream" => {
                serve_stream(&mut writer, &state);
                return;
            }
            "/capture" => {
                let snapshot_up = {
                    let mut device = state.lock().unwrap();
                    if !counted_capture {
                        device.capture_connections += 1;
                        counted_capture = true;
                    }
                    device.snapshot_up
                };
                if !snapshot_up {
                    let _ = writer.write_all(
                        b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n",
                    );
                    continue;
                }
                let shade = {
                    let mut device = state.lock().unwrap();
                    device.captures_served += 1;
                    (device.captures_served % 255) as u8
                };
                let body = jpeg(shade);
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nContent-Disposition: inline; filename=capture.jpg\r\n\r\n",
                    body.len()
                );
                if writer.write_all(head.as_bytes()).is_err() || writer.write_all(&body).is_err() {
                    return;
                }
            }
            _ => {
                let _ = writer.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
            }
        }
    }
}

fn serve_stream(writer: &mut TcpStream, state: &Arc<Mutex<DeviceState>>) {
    let (stream_up, limit) = {
        let mut device = state.lock().unwrap();
        if device.stream_up {
            device.stream_connections += 1;
        }
        (device.stream_up, device.frames_per_connection)
    };
    if !stream_up {
        let _ = writer.write_all(
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace;boundary={}\r\nAccess-Control-Allow-Origin: *\r\n\r\n",
        BOUNDARY
    );
    if writer.write_all(head.as_bytes()).is_err() {
        return;
    }

    let mut sent = 0u32;
    loop {
        if limit.is_some_and(|limit| sent >= limit) || !state.lock().unwrap().stream_up {
            return;
        }
        let body = jpeg((sent % 255) as u8);
        let mut part = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: {}.000000\r\n\r\n",
            BOUNDARY,
            body.len(),
            sent
        )
        .into_bytes();
        part.extend_from_slice(&body);
        part.extend_from_slice(b"\r\n");
        if writer.write_all(&part).is_err() {
            return;
        }
        sent += 1;
        thread::sleep(Duration::from_millis(30));
    }
}

fn fast_config(base_url: String) -> SourceConfig {
    let mut cfg = SourceConfig::new(base_url);
    cfg.stream_suffixes = vec!["/stream".to_string()];
    cfg.probe_tries = 2;
    cfg.reconnect_tries = 2;
    cfg.probe_backoff = Duration::from_millis(20);
    cfg.connect_timeout = Duration::from_millis(500);
    cfg.stream_read_timeout = Duration::from_secs(1);
    cfg.snapshot_timeout = Duration::from_secs(1);
    cfg.snapshot_rate_hz = 50.0;
    cfg.stream_reprobe_interval = None;
    cfg
}

fn next_frame_via(
    source: &FrameSource,
    transport: TransportKind,
    within: Duration,
) -> Option<Frame> {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if let NextFrame::Frame(frame) = source.next_frame(Duration::from_millis(100)) {
            if frame.transport == transport {
                return Some(frame);
            }
        }
    }
    None
}

#[test]
fn streams_from_the_secondary_port_when_the_primary_refuses() {
    let primary = FakeEsp32::spawn(false, true);
    let secondary = FakeEsp32::spawn(true, false);
    let mut cfg = fast_config(primary.base_url());
    cfg.stream_suffixes = vec![
        "/stream".to_string(),
        format!(":{}/stream", secondary.port),
    ];

    let source = FrameSource::new(cfg).expect("frame source");
    let frame = next_frame_via(&source, TransportKind::Stream, Duration::from_secs(5))
        .expect("stream frame");
    assert_eq!(frame.width, FRAME_WIDTH);
    assert_eq!(frame.height, FRAME_HEIGHT);
    assert_eq!(frame.pixels().len(), (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize);

    let status = source.status();
    assert_eq!(status.state, SourceState::StreamActive);
    let endpoint = status.endpoint.expect("active endpoint");
    assert!(endpoint.contains(&format!(":{}/stream", secondary.port)));
    assert_eq!(secondary.state().stream_connections, 1);
    source.stop().expect("stop");
}

#[test]
fn falls_back_to_snapshots_over_one_keep_alive_connection() {
    let camera = FakeEsp32::spawn(false, true);
    let source = FrameSource::new(fast_config(camera.base_url())).expect("frame source");

    let mut last_sequence = 0;
    for _ in 0..5 {
        let frame = next_frame_via(&source, TransportKind::Snapshot, Duration::from_secs(5))
            .expect("snapshot frame");
        assert!(frame.sequence > last_sequence);
        last_sequence = frame.sequence;
        assert_eq!(frame.width, FRAME_WIDTH);
    }
    assert_eq!(source.state(), SourceState::SnapshotActive);
    source.stop().expect("stop");

    let device = camera.state();
    assert!(device.captures_served >= 5);
    assert!(
        device.capture_connections < device.captures_served,
        "{} connections for {} captures",
        device.capture_connections,
        device.captures_served
    );
}

#[test]
fn reconnects_after_the_device_drops_the_stream() {
    let camera = FakeEsp32::spawn(true, false);
    camera.state().frames_per_connection = Some(3);
    let cfg = fast_config(camera.base_url());
    // One broken read plus one probe round.
    let max_gap = cfg.stream_read_timeout + cfg.connect_timeout + cfg.probe_backoff;
    let source = FrameSource::new(cfg).expect("frame source");

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut received = 0;
    let mut last_frame_at: Option<Instant> = None;
    let mut widest_gap = Duration::ZERO;
    while received < 8 && Instant::now() < deadline {
        if let NextFrame::Frame(frame) = source.next_frame(Duration::from_millis(100)) {
            assert_eq!(frame.transport, TransportKind::Stream);
            let now = Instant::now();
            if let Some(previous) = last_frame_at {
                widest_gap = widest_gap.max(now - previous);
            }
            last_frame_at = Some(now);
            received += 1;
        }
    }
    assert_eq!(received, 8);
    assert!(
        widest_gap <= max_gap,
        "frames {:?} apart across a reconnect, limit {:?}",
        widest_gap,
        max_gap
    );
    assert!(source.stats().stream_breaks >= 2);
    assert_eq!(source.stats().frames_snapshot, 0);
    assert!(camera.state().stream_connections >= 3);
    source.stop().expect("stop");
}

#[test]
fn snapshot_mode_returns_to_the_stream_once_it_recovers() {
    let camera = FakeEsp32::spawn(false, true);
    let mut cfg = fast_config(camera.base_url());
    cfg.stream_reprobe_interval = Some(Duration::from_millis(200));
    let source = FrameSource::new(cfg).expect("frame source");

    next_frame_via(&source, TransportKind::Snapshot, Duration::from_secs(5))
        .expect("snapshot frame");
    camera.state().stream_up = true;
    next_frame_via(&source, TransportKind::Stream, Duration::from_secs(5))
        .expect("stream frame after reprobe");
    assert_eq!(source.state(), SourceState::StreamActive);
    source.stop().expect("stop");
}

#[test]
fn dead_device_is_reported_unavailable_without_stopping() {
    let camera = FakeEsp32::spawn(false, false);
    let mut cfg = fast_config(camera.base_url());
    cfg.probe_tries = 1;
    cfg.escalation_threshold = 2;
    let source = FrameSource::new(cfg).expect("frame source");
    source.start().expect("start");

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut unavailable = false;
    while !unavailable && Instant::now() < deadline {
        unavailable = source.next_frame(Duration::from_millis(50)).is_unavailable();
    }
    assert!(unavailable);
    assert!(source.is_running());
    assert!(!source.is_healthy());

    camera.state().snapshot_up = true;
    next_frame_via(&source, TransportKind::Snapshot, Duration::from_secs(5))
        .expect("snapshot frame after recovery");
    assert!(!source.status().unavailable);
    source.stop().expect("stop");
}
