//! Cross-device latency alignment
//!
//! Each device in a session has its own end-to-end latency (network path,
//! jitter buffer, resampler, hardware output). The engine keeps one
//! [`DeviceSyncProfile`] per device and, when re-evaluated, delays every
//! device up to a common target so they all render in phase:
//!
//! ```text
//! target  = max(max measured latency, configured floor)
//! applied = target - measured
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::SyncConfig;

/// Latency and compensation state for one output device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSyncProfile {
    pub device_id: String,
    /// Effective end-to-end latency
    pub measured_latency_ms: f64,
    /// Extra delay applied downstream of the resampler
    pub applied_delay_ms: f64,
    /// Output gain applied with the delay
    pub applied_gain: f64,
    /// Measurements that had to fall back after a timeout
    pub timeouts: u32,
    pub joined_at: DateTime<Utc>,
    pub measured_at: Option<DateTime<Utc>>,
}

impl DeviceSyncProfile {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            measured_latency_ms: 0.0,
            applied_delay_ms: 0.0,
            applied_gain: 1.0,
            timeouts: 0,
            joined_at: Utc::now(),
            measured_at: None,
        }
    }

    /// Latency at which this device renders once its delay is applied
    pub fn aligned_latency_ms(&self) -> f64 {
        self.measured_latency_ms + self.applied_delay_ms
    }
}

/// Result of one alignment pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentReport {
    pub target_latency_ms: f64,
    /// Largest difference in aligned latency between any two devices
    pub spread_ms: f64,
    pub within_tolerance: bool,
    pub devices: Vec<DeviceSyncProfile>,
    pub evaluated_at: DateTime<Utc>,
}

/// Per-device latency measurement store and delay calculator
pub struct PrecisionSyncEngine {
    config: SyncConfig,
    max_delay_ms: f64,
    profiles: DashMap<String, DeviceSyncProfile>,
}

impl PrecisionSyncEngine {
    /// `max_delay_ms` is the largest delay the output stage can hold
    pub fn new(config: SyncConfig, max_delay_ms: f64) -> Self {
        Self {
            config,
            max_delay_ms: max_delay_ms.max(0.0),
            profiles: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a device joining the session
    pub fn add_device(&self, device_id: &str) {
        if !self.profiles.contains_key(device_id) {
            tracing::info!("Device {} joined sync group", device_id);
            self.profiles
                .insert(device_id.to_string(), DeviceSyncProfile::new(device_id));
        }
    }

    /// Discard a disconnected device
    pub fn remove_device(&self, device_id: &str) -> Option<DeviceSyncProfile> {
        let removed = self.profiles.remove(device_id).map(|(_, profile)| profile);
        if removed.is_some() {
            tracing::info!("Device {} left sync group", device_id);
        }
        removed
    }

    pub fn device_count(&self) -> usize {
        self.profiles.len()
    }

    /// Store a completed latency measurement
    pub fn record_latency(&self, device_id: &str, latency_ms: f64) {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            tracing::warn!("Ignoring invalid latency {} for {}", latency_ms, device_id);
            return;
        }
        let mut profile = self
            .profiles
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceSyncProfile::new(device_id));
        profile.measured_latency_ms = latency_ms;
        profile.measured_at = Some(Utc::now());
        tracing::debug!("Device {} latency {:.2} ms", device_id, latency_ms);
    }

    /// Measure a device acoustically: find `reference` (a played calibration
    /// signal) in `captured` (what a microphone heard) and record the lag as
    /// the device latency. Returns the latency if the tone was found; an
    /// undetected tone leaves the profile untouched.
    pub fn record_tone_measurement(
        &self,
        device_id: &str,
        reference: &[f32],
        captured: &[f32],
        sample_rate: u32,
        max_lag: usize,
    ) -> Option<f64> {
        match estimate_latency_from_tone(reference, captured, sample_rate, max_lag) {
            Some(latency_ms) => {
                self.record_latency(device_id, latency_ms);
                Some(latency_ms)
            }
            None => {
                tracing::warn!("Calibration tone not detected for {}", device_id);
                None
            }
        }
    }

    /// Store the fallback of a timed-out measurement
    pub fn record_timeout(&self, device_id: &str, fallback_ms: f64) {
        let mut profile = self
            .profiles
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceSyncProfile::new(device_id));
        profile.timeouts += 1;
        if fallback_ms.is_finite() && fallback_ms >= 0.0 {
            profile.measured_latency_ms = fallback_ms;
        }
        tracing::warn!(
            "Latency probe to {} timed out, keeping {:.2} ms",
            device_id,
            profile.measured_latency_ms
        );
    }

    /// Set the output gain for a device. Returns false for unknown devices.
    pub fn set_gain(&self, device_id: &str, gain: f64) -> bool {
        match self.profiles.get_mut(device_id) {
            Some(mut profile) => {
                profile.applied_gain = if gain.is_finite() { gain.max(0.0) } else { 1.0 };
                true
            }
            None => false,
        }
    }

    /// Recompute every device's delay against the common target.
    /// Returns `None` when no devices are registered.
    pub fn evaluate(&self) -> Option<AlignmentReport> {
        if self.profiles.is_empty() {
            return None;
        }

        let max_measured = self
            .profiles
            .iter()
            .map(|p| p.measured_latency_ms)
            .fold(f64::NEG_INFINITY, f64::max);
        let target = max_measured.max(self.config.latency_floor_ms);

        for mut profile in self.profiles.iter_mut() {
            let wanted = target - profile.measured_latency_ms;
            let applied = wanted.clamp(0.0, self.max_delay_ms);
            if applied < wanted {
                tracing::warn!(
                    "Device {} needs {:.2} ms delay, limited to {:.2} ms",
                    profile.device_id,
                    wanted,
                    applied
                );
            }
            profile.applied_delay_ms = applied;
        }

        let devices = self.profiles();
        let (lo, hi) = devices.iter().map(|p| p.aligned_latency_ms()).fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), v| (lo.min(v), hi.max(v)),
        );
        let spread_ms = hi - lo;
        let within_tolerance = spread_ms <= self.config.alignment_tolerance_ms;

        if within_tolerance {
            tracing::debug!(
                "Aligned {} devices to {:.2} ms (spread {:.2} ms)",
                devices.len(),
                target,
                spread_ms
            );
        } else {
            tracing::warn!(
                "Devices out of alignment: spread {:.2} ms exceeds {:.2} ms",
                spread_ms,
                self.config.alignment_tolerance_ms
            );
        }

        Some(AlignmentReport {
            target_latency_ms: target,
            spread_ms,
            within_tolerance,
            devices,
            evaluated_at: Utc::now(),
        })
    }

    pub fn profile(&self, device_id: &str) -> Option<DeviceSyncProfile> {
        self.profiles.get(device_id).map(|p| p.clone())
    }

    /// All profiles, ordered by device id
    pub fn profiles(&self) -> Vec<DeviceSyncProfile> {
        let mut all: Vec<DeviceSyncProfile> = self.profiles.iter().map(|p| p.clone()).collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }
}

/// Linear sine sweep used as a calibration signal. Unlike a steady tone its
/// autocorrelation has a single sharp peak.
pub fn calibration_sweep(sample_rate: u32, frames: usize, start_hz: f64, end_hz: f64) -> Vec<f32> {
    let sr = sample_rate as f64;
    let duration = frames as f64 / sr;
    let slope = if duration > 0.0 {
        (end_hz - start_hz) / duration
    } else {
        0.0
    };
    (0..frames)
        .map(|n| {
            let t = n as f64 / sr;
            let phase = 2.0 * std::f64::consts::PI * (start_hz * t + 0.5 * slope * t * t);
            phase.sin() as f32
        })
        .collect()
}

/// Minimum normalised correlation accepted as a detection
const DETECTION_THRESHOLD: f64 = 0.5;

/// Find where `reference` occurs in `captured`, searching lags up to
/// `max_lag` frames, and return that lag in milliseconds.
///
/// Both signals are mono. Returns `None` if the captured signal is too short
/// or no lag correlates above the detection threshold.
pub fn estimate_latency_from_tone(
    reference: &[f32],
    captured: &[f32],
    sample_rate: u32,
    max_lag: usize,
) -> Option<f64> {
    if reference.is_empty() || captured.len() < reference.len() || sample_rate == 0 {
        return None;
    }

    let ref_energy: f64 = reference.iter().map(|&x| (x as f64).powi(2)).sum();
    if ref_energy <= f64::EPSILON {
        return None;
    }

    let last_lag = (captured.len() - reference.len()).min(max_lag);
    let mut best: Option<(usize, f64)> = None;

    for lag in 0..=last_lag {
        let window = &captured[lag..lag + reference.len()];
        let mut dot = 0.0;
        let mut energy = 0.0;
        for (&r, &c) in reference.iter().zip(window) {
            dot += r as f64 * c as f64;
            energy += (c as f64).powi(2);
        }
        if energy <= f64::EPSILON {
            continue;
        }
        let score = dot / (ref_energy * energy).sqrt();
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((lag, score));
        }
    }

    match best {
        Some((lag, score)) if score >= DETECTION_THRESHOLD => {
            tracing::debug!("Tone detected at lag {} (correlation {:.3})", lag, score);
            Some(lag as f64 * 1000.0 / sample_rate as f64)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PrecisionSyncEngine {
        PrecisionSyncEngine::new(SyncConfig::default(), 100.0)
    }

    #[test]
    fn test_aligns_to_slowest_device() {
        let engine = engine();
        engine.add_device("a");
        engine.add_device("b");
        engine.record_latency("a", 2.0);
        engine.record_latency("b", 5.0);

        let report = engine.evaluate().unwrap();
        assert_eq!(report.target_latency_ms, 5.0);
        assert_eq!(engine.profile("a").unwrap().applied_delay_ms, 3.0);
        assert_eq!(engine.profile("b").unwrap().applied_delay_ms, 0.0);
        assert_eq!(report.spread_ms, 0.0);
        assert!(report.within_tolerance);
    }

    #[test]
    fn test_floor_raises_target() {
        let config = SyncConfig {
            latency_floor_ms: 10.0,
            ..Default::default()
        };
        let engine = PrecisionSyncEngine::new(config, 100.0);
        engine.record_latency("a", 2.0);
        engine.record_latency("b", 5.0);

        let report = engine.evaluate().unwrap();
        assert_eq!(report.target_latency_ms, 10.0);
        assert_eq!(engine.profile("a").unwrap().applied_delay_ms, 8.0);
        assert_eq!(engine.profile("b").unwrap().applied_delay_ms, 5.0);
    }

    #[test]
    fn test_delay_limit_reported_as_spread() {
        let engine = PrecisionSyncEngine::new(SyncConfig::default(), 4.0);
        engine.record_latency("near", 1.0);
        engine.record_latency("far", 20.0);

        let report = engine.evaluate().unwrap();
        assert_eq!(engine.profile("near").unwrap().applied_delay_ms, 4.0);
        assert_eq!(report.spread_ms, 15.0);
        assert!(!report.within_tolerance);
    }

    #[test]
    fn test_timeout_keeps_previous_measurement() {
        let engine = engine();
        engine.add_device("a");
        engine.record_timeout("a", 0.0);
        assert_eq!(engine.profile("a").unwrap().measured_latency_ms, 0.0);

        engine.record_latency("a", 6.5);
        engine.record_timeout("a", 6.5);
        let profile = engine.profile("a").unwrap();
        assert_eq!(profile.measured_latency_ms, 6.5);
        assert_eq!(profile.timeouts, 2);
    }

    #[test]
    fn test_gain_and_membership() {
        let engine = engine();
        assert!(engine.evaluate().is_none());
        assert!(!engine.set_gain("ghost", 0.5));

        engine.add_device("a");
        engine.add_device("a");
        assert_eq!(engine.device_count(), 1);
        assert_eq!(engine.profile("a").unwrap().applied_gain, 1.0);
        assert!(engine.set_gain("a", 0.5));
        assert_eq!(engine.profile("a").unwrap().applied_gain, 0.5);

        assert!(engine.remove_device("a").is_some());
        assert!(engine.profile("a").is_none());
    }

    #[test]
    fn test_tone_lag_detected() {
        let reference = calibration_sweep(48000, 480, 200.0, 8000.0);
        let lag = 96;
        let mut captured = vec![0.0f32; 2000];
        for (i, s) in reference.iter().enumerate() {
            captured[lag + i] = s * 0.3;
        }

        let latency = estimate_latency_from_tone(&reference, &captured, 48000, 1000).unwrap();
        assert!((latency - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_tone_absent() {
        let reference = calibration_sweep(48000, 480, 200.0, 8000.0);
        assert_eq!(
            estimate_latency_from_tone(&reference, &vec![0.0; 2000], 48000, 1000),
            None
        );
        assert_eq!(estimate_latency_from_tone(&reference, &reference[..100], 48000, 10), None);
    }

    #[test]
    fn test_tone_measurement_feeds_alignment() {
        let engine = engine();
        let reference = calibration_sweep(48000, 480, 200.0, 8000.0);
        let mut captured = vec![0.0f32; 2000];
        for (i, s) in reference.iter().enumerate() {
            captured[240 + i] = s * 0.5;
        }

        let latency = engine
            .record_tone_measurement("speaker", &reference, &captured, 48000, 1000)
            .unwrap();
        assert!((latency - 5.0).abs() < 1e-9);
        engine.record_latency("headphones", 1.0);

        engine.evaluate().unwrap();
        let applied = engine.profile("headphones").unwrap().applied_delay_ms;
        assert!((applied - 4.0).abs() < 1e-9);

        // Silence keeps the earlier measurement
        assert!(engine
            .record_tone_measurement("speaker", &reference, &vec![0.0; 2000], 48000, 1000)
            .is_none());
        assert!((engine.profile("speaker").unwrap().measured_latency_ms - 5.0).abs() < 1e-9);
    }
}
