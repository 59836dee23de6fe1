//! Fixed output delay and gain, applied after the resampler
//!
//! The precision sync engine decides the delay on its own schedule; the
//! audio path only ever reads the latest value through [`DelayControl`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free delay/gain settings shared between the sync engine and the
/// audio path
#[derive(Debug)]
pub struct DelayControl {
    delay_ms: AtomicU64,
    gain: AtomicU64,
}

impl DelayControl {
    pub fn new() -> Self {
        Self {
            delay_ms: AtomicU64::new(0f64.to_bits()),
            gain: AtomicU64::new(1f64.to_bits()),
        }
    }

    pub fn set(&self, delay_ms: f64, gain: f64) {
        self.delay_ms.store(delay_ms.max(0.0).to_bits(), Ordering::Relaxed);
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn delay_ms(&self) -> f64 {
        f64::from_bits(self.delay_ms.load(Ordering::Relaxed))
    }

    pub fn gain(&self) -> f64 {
        f64::from_bits(self.gain.load(Ordering::Relaxed))
    }
}

impl Default for DelayControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to delay settings
pub type SharedDelayControl = Arc<DelayControl>;

/// Interleaved delay line with a preallocated maximum delay
pub struct DelayLine {
    channels: usize,
    sample_rate: u32,
    /// Ring of `max_frames + 1` frames
    ring: Vec<f32>,
    ring_frames: usize,
    write_pos: usize,
    delay_frames: usize,
    gain: f32,
}

impl DelayLine {
    pub fn new(channels: u16, sample_rate: u32, max_delay_ms: f64) -> Self {
        let channels = channels.max(1) as usize;
        let max_frames = ms_to_frames(max_delay_ms, sample_rate);
        let ring_frames = max_frames + 1;

        Self {
            channels,
            sample_rate,
            ring: vec![0.0; ring_frames * channels],
            ring_frames,
            write_pos: 0,
            delay_frames: 0,
            gain: 1.0,
        }
    }

    /// Largest supported delay in frames
    pub fn max_delay_frames(&self) -> usize {
        self.ring_frames - 1
    }

    /// Set the delay (clamped to the maximum) and gain
    pub fn set(&mut self, delay_ms: f64, gain: f64) {
        let frames = ms_to_frames(delay_ms, self.sample_rate).min(self.max_delay_frames());
        if frames != self.delay_frames {
            tracing::debug!(
                "Output delay {} -> {} frames ({:.2} ms)",
                self.delay_frames,
                frames,
                delay_ms
            );
        }
        self.delay_frames = frames;
        self.gain = if gain.is_finite() { gain as f32 } else { 1.0 };
    }

    pub fn delay_frames(&self) -> usize {
        self.delay_frames
    }

    /// Delay and scale `buffer` in place
    pub fn process(&mut self, buffer: &mut [f32]) {
        let channels = self.channels;
        for frame in buffer.chunks_exact_mut(channels) {
            let write = self.write_pos * channels;
            self.ring[write..write + channels].copy_from_slice(frame);

            let read_pos = (self.write_pos + self.ring_frames - self.delay_frames) % self.ring_frames;
            let read = read_pos * channels;
            for (c, sample) in frame.iter_mut().enumerate() {
                *sample = self.ring[read + c] * self.gain;
            }

            self.write_pos = (self.write_pos + 1) % self.ring_frames;
        }
    }

    pub fn reset(&mut self) {
        self.ring.fill(0.0);
        self.write_pos = 0;
    }
}

fn ms_to_frames(ms: f64, sample_rate: u32) -> usize {
    if !ms.is_finite() || ms <= 0.0 {
        return 0;
    }
    (ms * sample_rate as f64 / 1000.0).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_delay_passthrough() {
        let mut line = DelayLine::new(2, 48000, 10.0);
        let mut buf = vec![0.1, 0.2, 0.3, 0.4];
        line.process(&mut buf);
        assert_eq!(buf, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_delay_in_frames() {
        let mut line = DelayLine::new(1, 1000, 10.0);
        line.set(3.0, 1.0);
        assert_eq!(line.delay_frames(), 3);

        let mut buf: Vec<f32> = (1..=6).map(|v| v as f32).collect();
        line.process(&mut buf);
        assert_eq!(buf, vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);

        let mut next = vec![7.0, 8.0];
        line.process(&mut next);
        assert_eq!(next, vec![4.0, 5.0]);
    }

    #[test]
    fn test_delay_clamped_and_gain_applied() {
        let mut line = DelayLine::new(1, 1000, 5.0);
        line.set(50.0, 0.5);
        assert_eq!(line.delay_frames(), 5);

        line.set(0.0, 0.5);
        let mut buf = vec![1.0, -1.0];
        line.process(&mut buf);
        assert_eq!(buf, vec![0.5, -0.5]);
    }

    #[test]
    fn test_control_roundtrip() {
        let control = DelayControl::new();
        assert_eq!(control.delay_ms(), 0.0);
        assert_eq!(control.gain(), 1.0);
        control.set(-3.0, 0.8);
        assert_eq!(control.delay_ms(), 0.0);
        assert_eq!(control.gain(), 0.8);
    }
}
