//! Streaming fractional-rate resampler
//!
//! Each input frame is run through a fixed windowed-sinc low-pass, and the
//! output is linearly interpolated between the two most recent filtered
//! frames at the current fractional phase. Filter history, the two filtered
//! frames and the phase all persist across calls, so block boundaries are
//! invisible in the output.
//!
//! All buffers are sized at construction; `process` never allocates.

use crate::dsp::filter::FirFilter;

/// Per-channel streaming resampler
pub struct Resampler {
    channels: usize,
    filter: FirFilter,
    /// Per channel: `2 * taps` samples, every input written twice so the
    /// newest `taps` samples are always contiguous
    history: Vec<f32>,
    write_pos: usize,
    /// Previous and current filtered frame
    prev: Vec<f32>,
    curr: Vec<f32>,
    /// Fractional position between `prev` and `curr`, in [0, 1)
    phase: f64,
    /// Input frames consumed per output frame
    increment: f64,
    nominal_rate: f64,
    output_rate: f64,
    max_deviation_hz: f64,
    frames_in: u64,
    frames_out: u64,
    starved_frames: u64,
}

impl Resampler {
    /// Create a resampler for `channels` interleaved channels at
    /// `nominal_rate`, allowing output rates within `±max_deviation_hz`.
    pub fn new(
        channels: u16,
        nominal_rate: u32,
        max_deviation_hz: f64,
        taps: usize,
        cutoff: f64,
    ) -> Self {
        let channels = channels.max(1) as usize;
        let filter = FirFilter::low_pass(taps, cutoff);
        let taps = filter.len();

        Self {
            channels,
            filter,
            history: vec![0.0; channels * taps * 2],
            write_pos: 0,
            prev: vec![0.0; channels],
            curr: vec![0.0; channels],
            phase: 0.0,
            increment: 1.0,
            nominal_rate: nominal_rate as f64,
            output_rate: nominal_rate as f64,
            max_deviation_hz,
            frames_in: 0,
            frames_out: 0,
            starved_frames: 0,
        }
    }

    /// Set the output rate. Clamped to the configured range around the
    /// nominal rate; returns the rate actually applied.
    pub fn set_output_rate(&mut self, rate: f64) -> f64 {
        let rate = if rate.is_finite() {
            rate.clamp(
                self.nominal_rate - self.max_deviation_hz,
                self.nominal_rate + self.max_deviation_hz,
            )
        } else {
            self.nominal_rate
        };
        self.output_rate = rate;
        self.increment = self.nominal_rate / rate;
        debug_assert!(self.increment.is_finite() && self.increment > 0.0);
        rate
    }

    pub fn output_rate(&self) -> f64 {
        self.output_rate
    }

    pub fn phase_increment(&self) -> f64 {
        self.increment
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    /// Input frames that `process` will consume to produce `out_frames`
    pub fn frames_needed(&self, out_frames: usize) -> usize {
        let mut phase = self.phase;
        let mut needed = 0;
        for _ in 0..out_frames {
            phase += self.increment;
            while phase >= 1.0 {
                phase -= 1.0;
                needed += 1;
            }
        }
        needed
    }

    /// Upper bound on input frames for `out_frames`, for sizing scratch buffers
    pub fn max_frames_needed(&self, out_frames: usize) -> usize {
        let max_increment = self.nominal_rate / (self.nominal_rate - self.max_deviation_hz);
        (out_frames as f64 * max_increment).ceil() as usize + 1
    }

    /// Total delay through the resampler in input frames
    pub fn latency_frames(&self) -> f64 {
        self.filter.group_delay() + 2.0
    }

    /// Produce `output.len() / channels` frames from interleaved `input`.
    /// Returns the number of input frames consumed. If `input` runs out
    /// the remaining frames are fed as silence and counted as starved.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        let channels = self.channels;
        let out_frames = output.len() / channels;
        let in_frames = input.len() / channels;
        let mut consumed = 0;

        for frame in output.chunks_exact_mut(channels).take(out_frames) {
            let t = self.phase as f32;
            for (c, sample) in frame.iter_mut().enumerate() {
                *sample = self.prev[c] + (self.curr[c] - self.prev[c]) * t;
            }

            self.phase += self.increment;
            while self.phase >= 1.0 {
                self.phase -= 1.0;
                if consumed < in_frames {
                    let start = consumed * channels;
                    self.consume_frame(Some(&input[start..start + channels]));
                } else {
                    self.consume_frame(None);
                    self.starved_frames += 1;
                }
                consumed += 1;
            }
        }

        debug_assert!((0.0..1.0).contains(&self.phase));
        self.frames_out += out_frames as u64;
        consumed.min(in_frames)
    }

    /// Push one input frame through the filter
    fn consume_frame(&mut self, frame: Option<&[f32]>) {
        let taps = self.filter.len();
        let pos = self.write_pos;

        for c in 0..self.channels {
            let x = frame.map(|f| f[c]).unwrap_or(0.0);
            let ring = &mut self.history[c * taps * 2..(c + 1) * taps * 2];
            ring[pos] = x;
            ring[pos + taps] = x;

            // Oldest..newest lives at [pos + 1, pos + taps]
            let y = self.filter.apply(&ring[pos + 1..pos + 1 + taps]);
            self.prev[c] = self.curr[c];
            self.curr[c] = y;
        }

        self.write_pos = (pos + 1) % taps;
        self.frames_in += 1;
    }

    /// Forget all history and return to zero drift
    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.prev.fill(0.0);
        self.curr.fill(0.0);
        self.write_pos = 0;
        self.phase = 0.0;
        self.set_output_rate(self.nominal_rate);
    }

    pub fn stats(&self) -> ResamplerStats {
        ResamplerStats {
            frames_in: self.frames_in,
            frames_out: self.frames_out,
            starved_frames: self.starved_frames,
            output_rate: self.output_rate,
        }
    }
}

/// Resampler counters
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ResamplerStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub starved_frames: u64,
    pub output_rate: f64,
}
