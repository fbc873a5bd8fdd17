//! Transport probe.
//!
//! Tries each candidate stream endpoint once per round, in priority order,
//! sleeping a fixed backoff between rounds. A failed open never leaves a
//! connection behind: the transport drops it before returning the error.

use std::time::Duration;

use crate::endpoint::CameraEndpoint;
use crate::ingest::{CameraTransport, JpegStream};
use crate::signal::StopSignal;

/// A stream connection bound to the endpoint that accepted it.
pub struct OpenStream {
    pub endpoint: CameraEndpoint,
    pub stream: Box<dyn JpegStream>,
}

pub enum ProbeOutcome {
    Opened { stream: OpenStream, failed_rounds: u32 },
    Exhausted { rounds: u32 },
    Cancelled,
}

pub struct TransportProbe {
    endpoints: Vec<CameraEndpoint>,
    backoff: Duration,
}

impl TransportProbe {
    pub fn new(endpoints: Vec<CameraEndpoint>, backoff: Duration) -> Self {
        Self { endpoints, backoff }
    }

    pub fn endpoints(&self) -> &[CameraEndpoint] {
        &self.endpoints
    }

    /// Run up to `tries` rounds. The backoff is skipped after the final
    /// round, so an exhausted probe spends at most `(tries - 1) * backoff`
    /// sleeping.
    pub fn run(
        &self,
        transport: &dyn CameraTransport,
        tries: u32,
        stop: &StopSignal,
    ) -> ProbeOutcome {
        let tries = tries.max(1);
        for round in 1..=tries {
            for endpoint in &self.endpoints {
                if stop.is_stopped() {
                    return ProbeOutcome::Cancelled;
                }
                match transport.open_stream(endpoint) {
                    Ok(stream) => {
                        log::info!("using mjpeg stream {}", endpoint.as_str());
                        return ProbeOutcome::Opened {
                            stream: OpenStream {
                                endpoint: endpoint.clone(),
                                stream,
                            },
                            failed_rounds: round - 1,
                        };
                    }
                    Err(err) => {
                        log::debug!("stream open failed on {}: {:#}", endpoint.as_str(), err);
                    }
                }
            }
            if round < tries {
                log::info!(
                    "mjpeg open failed (try {}/{}); retrying in {:?}",
                    round,
                    tries,
                    self.backoff
                );
                if !stop.sleep(self.backoff) {
                    return ProbeOutcome::Cancelled;
                }
            } else {
                log::info!("mjpeg open failed (try {}/{}); giving up", round, tries);
            }
        }
        ProbeOutcome::Exhausted { rounds: tries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{parse_base_url, stream_endpoints};
    use crate::ingest::SnapshotSession;
    use anyhow::{anyhow, Result};
    use std::sync::Mutex;
    use std::time::Instant;

    struct NullStream;

    impl JpegStream for NullStream {
        fn read_jpeg(&mut self) -> Result<Vec<u8>> {
            Err(anyhow!("unused"))
        }
    }

    /// Accepts the endpoint at `accept_index` after `fail_first` attempts.
    struct CountingTransport {
        attempts: Mutex<Vec<String>>,
        accept_suffix: Option<&'static str>,
        fail_first: usize,
    }

    impl CameraTransport for CountingTransport {
        fn open_stream(&self, endpoint: &CameraEndpoint) -> Result<Box<dyn JpegStream>> {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(endpoint.as_str().to_string());
            let accepted = self
                .accept_suffix
                .map(|suffix| endpoint.as_str().ends_with(suffix))
                .unwrap_or(false);
            if accepted && attempts.len() > self.fail_first {
                Ok(Box::new(NullStream))
            } else {
                Err(anyhow!("connection refused"))
            }
        }

        fn open_session(&self, _endpoint: &CameraEndpoint) -> Box<dyn SnapshotSession> {
            unreachable!("probe never opens snapshot sessions")
        }
    }

    fn probe(backoff_ms: u64) -> Result<TransportProbe> {
        let base = parse_base_url("http://192.168.0.193")?;
        let suffixes = vec!["/stream".to_string(), ":81/stream".to_string()];
        Ok(TransportProbe::new(
            stream_endpoints(&base, &suffixes)?,
            Duration::from_millis(backoff_ms),
        ))
    }

    #[test]
    fn tries_primary_then_secondary_each_round() -> Result<()> {
        let transport = CountingTransport {
            attempts: Mutex::new(Vec::new()),
            accept_suffix: Some(":81/stream"),
            fail_first: 2,
        };
        let probe = probe(1)?;
        assert_eq!(probe.endpoints().len(), 2);
        let outcome = probe.run(&transport, 3, &StopSignal::new());
        let ProbeOutcome::Opened { stream, failed_rounds } = outcome else {
            panic!("expected the secondary endpoint to open");
        };
        assert_eq!(stream.endpoint.as_str(), "http://192.168.0.193:81/stream");
        assert_eq!(failed_rounds, 1);
        assert_eq!(
            *transport.attempts.lock().unwrap(),
            vec![
                "http://192.168.0.193/stream",
                "http://192.168.0.193:81/stream",
                "http://192.168.0.193/stream",
                "http://192.168.0.193:81/stream",
            ]
        );
        Ok(())
    }

    #[test]
    fn exhausts_within_the_backoff_budget() -> Result<()> {
        let transport = CountingTransport {
            attempts: Mutex::new(Vec::new()),
            accept_suffix: None,
            fail_first: 0,
        };
        let started = Instant::now();
        let outcome = probe(20)?.run(&transport, 3, &StopSignal::new());
        let elapsed = started.elapsed();
        assert!(matches!(outcome, ProbeOutcome::Exhausted { rounds: 3 }));
        assert_eq!(transport.attempts.lock().unwrap().len(), 6);
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(60 + 500));
        Ok(())
    }

    #[test]
    fn stop_cancels_a_probe_mid_backoff() -> Result<()> {
        let transport = CountingTransport {
            attempts: Mutex::new(Vec::new()),
            accept_suffix: None,
            fail_first: 0,
        };
        let stop = StopSignal::new();
        let remote = stop.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.stop();
        });
        let outcome = probe(10_000)?.run(&transport, 3, &stop);
        stopper.join().unwrap();
        assert!(matches!(outcome, ProbeOutcome::Cancelled));
        Ok(())
    }
}
