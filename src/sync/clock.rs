//! Clock recovery controller
//!
//! The receiver cannot change the sender's clock; it can only play back
//! slightly faster or slower. Once per audio callback the smoothed jitter
//! buffer level is compared to the target and a PID loop turns the error
//! into a small output-rate offset for the resampler:
//!
//! - level above target -> negative offset -> resampler consumes input faster
//! - level below target -> positive offset -> resampler consumes input slower
//!
//! The offset is hard-clamped to `±resampling_range_hz`.

use serde::Serialize;

use crate::audio::jitter::BufferHealth;
use crate::config::{ClockConfig, SessionConfig};

/// Control loop state, mutated once per cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockState {
    pub target_sample_rate: f64,
    pub current_sample_rate: f64,
    pub drift_ppm: f64,
    pub pid_integral: f64,
    pub pid_previous_error: f64,
}

/// Read-only copy of the controller outputs
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockSnapshot {
    pub current_sample_rate: f64,
    pub adjustment_hz: f64,
    pub drift_ppm: f64,
    pub health: BufferHealth,
    pub stability_score: f64,
    pub degraded: bool,
}

/// PID-based drift correction
pub struct ClockRecoveryController {
    config: ClockConfig,
    target_level: f64,
    min_level: f64,
    max_level: f64,
    range_hz: f64,
    state: ClockState,
    has_previous: bool,
    health: BufferHealth,
    stability: f64,
    /// Ring of recent levels for the variance estimate
    window: Vec<f64>,
    window_pos: usize,
    window_len: usize,
    risk_secs: f64,
    degraded: bool,
}

impl ClockRecoveryController {
    pub fn new(session: &SessionConfig) -> Self {
        let config = session.clock.clone();
        let window = vec![0.0; config.stability_window.max(1)];
        let rate = session.sample_rate as f64;

        Self {
            target_level: session.jitter_target_packets as f64,
            min_level: session.jitter_min_packets as f64,
            max_level: session.jitter_max_packets as f64,
            range_hz: session.resampling_range_hz,
            state: ClockState {
                target_sample_rate: rate,
                current_sample_rate: rate,
                drift_ppm: 0.0,
                pid_integral: 0.0,
                pid_previous_error: 0.0,
            },
            has_previous: false,
            health: BufferHealth::Stable,
            stability: 1.0,
            window,
            window_pos: 0,
            window_len: 0,
            risk_secs: 0.0,
            degraded: false,
            config,
        }
    }

    /// Run one control cycle on the smoothed buffer level (packets), `dt`
    /// seconds after the previous one. Returns the new output rate in Hz.
    pub fn update(&mut self, smoothed_level: f64, dt: f64) -> f64 {
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 1e-3 };
        let error = smoothed_level - self.target_level;

        let ClockConfig { kp, ki, kd, .. } = self.config;

        // Anti-windup: the integral term alone can never exceed the range
        let mut integral = self.state.pid_integral + error * dt;
        if ki > 0.0 {
            let limit = self.range_hz / ki;
            integral = integral.clamp(-limit, limit);
        }

        let derivative = if self.has_previous {
            (error - self.state.pid_previous_error) / dt
        } else {
            0.0
        };

        let output = kp * error + ki * integral + kd * derivative;
        let adjustment = (-output).clamp(-self.range_hz, self.range_hz);

        let target = self.state.target_sample_rate;
        self.state.pid_integral = integral;
        self.state.pid_previous_error = error;
        self.state.current_sample_rate = target + adjustment;
        self.state.drift_ppm = adjustment / target * 1_000_000.0;
        self.has_previous = true;

        debug_assert!(
            (self.state.current_sample_rate - target).abs() <= self.range_hz + 1e-9,
            "rate correction outside clamp"
        );

        self.classify(smoothed_level, dt);
        self.state.current_sample_rate
    }

    fn classify(&mut self, level: f64, dt: f64) {
        self.health = BufferHealth::classify(
            level,
            self.min_level,
            self.target_level,
            self.max_level,
            self.config.tolerance_packets,
        );

        self.window[self.window_pos] = level;
        self.window_pos = (self.window_pos + 1) % self.window.len();
        self.window_len = (self.window_len + 1).min(self.window.len());

        if self.window_variance() > self.config.variance_threshold {
            self.stability = (self.stability - 0.01).max(0.0);
        } else {
            self.stability = (self.stability + 0.005).min(1.0);
        }

        if self.health.is_risk() {
            self.risk_secs += dt;
            if !self.degraded && self.risk_secs * 1000.0 >= self.config.grace_period_ms {
                self.degraded = true;
                tracing::warn!(
                    "Sustained {:?}: level {:.2} packets for {:.0} ms, correction {:.2} Hz",
                    self.health,
                    level,
                    self.risk_secs * 1000.0,
                    self.adjustment_hz()
                );
            }
        } else {
            if self.degraded {
                tracing::info!(
                    "Buffer recovered to {:?} after {:.0} ms",
                    self.health,
                    self.risk_secs * 1000.0
                );
            }
            self.risk_secs = 0.0;
            self.degraded = false;
        }
    }

    fn window_variance(&self) -> f64 {
        if self.window_len < 2 {
            return 0.0;
        }
        let samples = &self.window[..self.window_len];
        let mean = samples.iter().sum::<f64>() / self.window_len as f64;
        samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.window_len as f64
    }

    /// Offset from the nominal rate in Hz
    pub fn adjustment_hz(&self) -> f64 {
        self.state.current_sample_rate - self.state.target_sample_rate
    }

    pub fn state(&self) -> &ClockState {
        &self.state
    }

    pub fn health(&self) -> BufferHealth {
        self.health
    }

    pub fn stability_score(&self) -> f64 {
        self.stability
    }

    /// Risk state has outlasted the grace period
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            current_sample_rate: self.state.current_sample_rate,
            adjustment_hz: self.adjustment_hz(),
            drift_ppm: self.state.drift_ppm,
            health: self.health,
            stability_score: self.stability,
            degraded: self.degraded,
        }
    }

    /// Return to the nominal rate with a clean integrator
    pub fn reset(&mut self) {
        let rate = self.state.target_sample_rate;
        self.state = ClockState {
            target_sample_rate: rate,
            current_sample_rate: rate,
            drift_ppm: 0.0,
            pid_integral: 0.0,
            pid_previous_error: 0.0,
        };
        self.has_previous = false;
        self.window_len = 0;
        self.window_pos = 0;
        self.risk_secs = 0.0;
        self.degraded = false;
        self.stability = 1.0;
    }
}
