//! Round-trip latency probe
//!
//! A request/response state machine with no I/O of its own. The host sends
//! whatever [`ProbeStep::Send`] hands it, feeds replies to
//! [`LatencyProbe::on_reply`] and calls [`LatencyProbe::poll`] on its own
//! schedule so timeouts fire. One measurement is the median of several
//! round trips, each counted as `rtt / 2 + responder output latency`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::{capture_timestamp, ControlPacket};

/// Where the probe is in its measurement round
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeState {
    Idle,
    Awaiting { nonce: u64, sent: Instant },
    Complete { latency_ms: f64 },
    TimedOut { fallback_ms: f64 },
}

/// What the host should do next
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeStep {
    /// Nothing to do yet
    Waiting,
    /// Transmit this request to the device
    Send(ControlPacket),
    /// Measurement finished
    Complete(f64),
    /// Device did not answer in time; use this fallback
    TimedOut(f64),
}

/// Latency measurement for one device
#[derive(Debug)]
pub struct LatencyProbe {
    timeout: Duration,
    samples_wanted: usize,
    samples: Vec<f64>,
    state: ProbeState,
    next_nonce: u64,
    /// Last completed measurement, used as the timeout fallback
    previous_ms: Option<f64>,
}

impl LatencyProbe {
    pub fn new(timeout: Duration, samples_wanted: usize) -> Self {
        let (seed, _) = uuid::Uuid::new_v4().as_u64_pair();
        Self {
            timeout,
            samples_wanted: samples_wanted.max(1),
            samples: Vec::with_capacity(samples_wanted.max(1)),
            state: ProbeState::Idle,
            next_nonce: seed,
            previous_ms: None,
        }
    }

    /// Seed the timeout fallback with an earlier measurement
    pub fn with_previous(mut self, latency_ms: f64) -> Self {
        self.previous_ms = Some(latency_ms);
        self
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Previous measurement, if any
    pub fn previous_ms(&self) -> Option<f64> {
        self.previous_ms
    }

    /// Start a new measurement round
    pub fn begin(&mut self, now: Instant) -> ProbeStep {
        self.samples.clear();
        self.send_next(now)
    }

    fn send_next(&mut self, now: Instant) -> ProbeStep {
        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.state = ProbeState::Awaiting { nonce, sent: now };
        ProbeStep::Send(ControlPacket::ProbeRequest {
            nonce,
            sent_at: capture_timestamp(),
        })
    }

    /// Feed a reply. Replies to anything but the outstanding request are
    /// ignored.
    pub fn on_reply(&mut self, reply: &ControlPacket, now: Instant) -> ProbeStep {
        let ProbeState::Awaiting { nonce, sent } = self.state else {
            return ProbeStep::Waiting;
        };
        let ControlPacket::ProbeReply {
            nonce: reply_nonce,
            output_latency_ms,
            ..
        } = *reply
        else {
            return ProbeStep::Waiting;
        };
        if reply_nonce != nonce {
            tracing::trace!("Ignoring stale probe reply {}", reply_nonce);
            return ProbeStep::Waiting;
        }

        let rtt_ms = now.saturating_duration_since(sent).as_micros() as f64 / 1000.0;
        let output_ms = if output_latency_ms.is_finite() {
            output_latency_ms.max(0.0) as f64
        } else {
            0.0
        };
        self.samples.push(rtt_ms / 2.0 + output_ms);

        if self.samples.len() >= self.samples_wanted {
            let latency_ms = median(&mut self.samples);
            self.previous_ms = Some(latency_ms);
            self.state = ProbeState::Complete { latency_ms };
            ProbeStep::Complete(latency_ms)
        } else {
            self.send_next(now)
        }
    }

    /// Check the outstanding request against the timeout
    pub fn poll(&mut self, now: Instant) -> ProbeStep {
        match self.state {
            ProbeState::Awaiting { sent, .. } if now.saturating_duration_since(sent) >= self.timeout => {
                // Partial results beat the fallback
                let fallback_ms = if self.samples.is_empty() {
                    self.previous_ms.unwrap_or(0.0)
                } else {
                    median(&mut self.samples)
                };
                tracing::debug!(
                    "Latency probe timed out after {} of {} samples, using {:.2} ms",
                    self.samples.len(),
                    self.samples_wanted,
                    fallback_ms
                );
                self.state = ProbeState::TimedOut { fallback_ms };
                ProbeStep::TimedOut(fallback_ms)
            }
            ProbeState::Complete { latency_ms } => ProbeStep::Complete(latency_ms),
            ProbeState::TimedOut { fallback_ms } => ProbeStep::TimedOut(fallback_ms),
            _ => ProbeStep::Waiting,
        }
    }

    /// Time until the outstanding request times out
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.state {
            ProbeState::Awaiting { sent, .. } => {
                Some(self.timeout.saturating_sub(now.saturating_duration_since(sent)))
            }
            _ => None,
        }
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Output latency a responder reports in its probe replies: the fixed
/// processing latency of its output stage plus whatever the audio device
/// adds. The device part starts at the configured value and is replaced by
/// the measured one once playback runs.
#[derive(Debug)]
pub struct OutputLatency {
    stage_ms: f64,
    device_ms: AtomicU64,
}

impl OutputLatency {
    pub fn new(stage_ms: f64, device_ms: f64) -> Self {
        Self {
            stage_ms,
            device_ms: AtomicU64::new(device_ms.max(0.0).to_bits()),
        }
    }

    pub fn stage_ms(&self) -> f64 {
        self.stage_ms
    }

    pub fn device_ms(&self) -> f64 {
        f64::from_bits(self.device_ms.load(Ordering::Relaxed))
    }

    /// Ignores negative and non-finite values
    pub fn set_device_ms(&self, device_ms: f64) {
        if device_ms.is_finite() && device_ms >= 0.0 {
            self.device_ms.store(device_ms.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn total_ms(&self) -> f64 {
        self.stage_ms + self.device_ms()
    }
}

/// Thread-safe handle to the reported output latency
pub type SharedOutputLatency = Arc<OutputLatency>;

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_for(step: ProbeStep, output_latency_ms: f32) -> ControlPacket {
        match step {
            ProbeStep::Send(request) => request.reply_to(output_latency_ms).unwrap(),
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[test]
    fn test_measures_median_of_round_trips() {
        let mut probe = LatencyProbe::new(Duration::from_millis(500), 3);
        let t0 = Instant::now();

        let mut step = probe.begin(t0);
        let mut now = t0;
        for rtt in [4u64, 40, 6] {
            let reply = reply_for(step, 1.0);
            now += Duration::from_millis(rtt);
            step = probe.on_reply(&reply, now);
        }

        // Samples: 3, 21, 4 -> median 4
        assert_eq!(step, ProbeStep::Complete(4.0));
        assert_eq!(probe.previous_ms(), Some(4.0));
    }

    #[test]
    fn test_stale_reply_ignored() {
        let mut probe = LatencyProbe::new(Duration::from_millis(500), 1);
        let t0 = Instant::now();
        let ProbeStep::Send(ControlPacket::ProbeRequest { nonce, sent_at }) = probe.begin(t0) else {
            panic!("expected a request");
        };

        let stale = ControlPacket::ProbeReply {
            nonce: nonce.wrapping_sub(1),
            sent_at,
            output_latency_ms: 0.0,
        };
        assert_eq!(probe.on_reply(&stale, t0), ProbeStep::Waiting);
        assert!(matches!(probe.state(), ProbeState::Awaiting { .. }));
    }

    #[test]
    fn test_timeout_falls_back_to_previous() {
        let mut probe = LatencyProbe::new(Duration::from_millis(100), 1);
        let t0 = Instant::now();

        // First round times out with nothing known: zero
        probe.begin(t0);
        assert_eq!(probe.poll(t0 + Duration::from_millis(50)), ProbeStep::Waiting);
        assert_eq!(
            probe.poll(t0 + Duration::from_millis(100)),
            ProbeStep::TimedOut(0.0)
        );

        // Second round succeeds
        let t1 = t0 + Duration::from_secs(1);
        let step = probe.begin(t1);
        let reply = reply_for(step, 2.0);
        assert_eq!(
            probe.on_reply(&reply, t1 + Duration::from_millis(10)),
            ProbeStep::Complete(7.0)
        );

        // Third round times out: previous value
        let t2 = t1 + Duration::from_secs(1);
        probe.begin(t2);
        assert_eq!(
            probe.poll(t2 + Duration::from_millis(200)),
            ProbeStep::TimedOut(7.0)
        );
        assert_eq!(probe.remaining(t2), None);
    }

    #[test]
    fn test_seeded_fallback() {
        let mut probe = LatencyProbe::new(Duration::from_millis(100), 3).with_previous(4.5);
        let t0 = Instant::now();
        probe.begin(t0);
        assert_eq!(probe.remaining(t0), Some(Duration::from_millis(100)));
        assert_eq!(
            probe.poll(t0 + Duration::from_millis(100)),
            ProbeStep::TimedOut(4.5)
        );
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&mut Vec::new()), 0.0);
    }

    #[test]
    fn test_output_latency_tracks_device() {
        let latency = OutputLatency::new(8.375, 2.0);
        assert_eq!(latency.total_ms(), 10.375);

        latency.set_device_ms(12.5);
        assert_eq!(latency.total_ms(), 20.875);

        latency.set_device_ms(f64::NAN);
        latency.set_device_ms(-1.0);
        assert_eq!(latency.device_ms(), 12.5);
    }
}
