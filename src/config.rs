//! Session and application configuration
//!
//! Every struct carries the documented defaults through `Default` and is
//! loaded from TOML with missing fields falling back to those defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::ConfigError;

/// Audio session parameters agreed out-of-band by sender and receivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Nominal sample rate in Hz
    pub sample_rate: u32,
    /// Frames carried by one packet
    pub frames_per_block: usize,
    /// Interleaved channel count
    pub channel_count: u16,
    /// Delay before the redundant copy of each packet
    pub redundancy_delay_ms: f64,
    /// Jitter buffer target level in packets
    pub jitter_target_packets: usize,
    /// Below this level the buffer is at risk of underflow
    pub jitter_min_packets: usize,
    /// Above this level the oldest blocks are dropped
    pub jitter_max_packets: usize,
    /// Hard clamp on the rate correction around `sample_rate`
    pub resampling_range_hz: f64,
    /// Out-of-order acceptance horizon in packets (default 4 x max level)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reorder_window_packets: Option<usize>,
    /// Number of recent ids remembered for dedup (default 8 x max level)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_window_packets: Option<usize>,
    /// Resampler FIR length
    pub resampler_taps: usize,
    /// Resampler cutoff as a fraction of Nyquist
    pub resampler_cutoff: f64,
    /// Upper bound for the per-device output delay stage
    pub max_output_delay_ms: f64,
    /// Clock recovery tuning
    pub clock: ClockConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frames_per_block: DEFAULT_FRAMES_PER_BLOCK,
            channel_count: DEFAULT_CHANNELS,
            redundancy_delay_ms: DEFAULT_REDUNDANCY_DELAY_MS,
            jitter_target_packets: DEFAULT_JITTER_TARGET_PACKETS,
            jitter_min_packets: DEFAULT_JITTER_MIN_PACKETS,
            jitter_max_packets: DEFAULT_JITTER_MAX_PACKETS,
            resampling_range_hz: DEFAULT_RESAMPLING_RANGE_HZ,
            reorder_window_packets: None,
            dedup_window_packets: None,
            resampler_taps: 33,
            resampler_cutoff: 0.45,
            max_output_delay_ms: 100.0,
            clock: ClockConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Interleaved samples carried by one packet
    pub fn samples_per_block(&self) -> usize {
        self.frames_per_block * self.channel_count as usize
    }

    /// PCM payload size in bytes
    pub fn payload_size(&self) -> usize {
        self.samples_per_block() * BYTES_PER_SAMPLE
    }

    /// Total datagram size (header + payload)
    pub fn packet_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload_size()
    }

    /// Duration of one block in seconds
    pub fn block_duration_secs(&self) -> f64 {
        self.frames_per_block as f64 / self.sample_rate as f64
    }

    /// Reorder window in packets
    pub fn reorder_window(&self) -> usize {
        self.reorder_window_packets
            .unwrap_or(self.jitter_max_packets * 4)
    }

    /// Dedup window in packet ids
    pub fn dedup_window(&self) -> usize {
        self.dedup_window_packets
            .unwrap_or(self.jitter_max_packets * 8)
    }

    /// Check every fatal constraint against the given payload limit.
    pub fn validate(&self, mtu_payload_limit: usize) -> Result<(), ConfigError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(ConfigError::UnsupportedSampleRate(self.sample_rate));
        }
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(ConfigError::InvalidChannels(self.channel_count));
        }
        if self.frames_per_block == 0 {
            return Err(ConfigError::InvalidFramesPerBlock(self.frames_per_block));
        }

        let size = self.packet_size();
        if size > mtu_payload_limit {
            return Err(ConfigError::PacketTooLarge {
                size,
                limit: mtu_payload_limit,
            });
        }

        let (min, target, max) = (
            self.jitter_min_packets,
            self.jitter_target_packets,
            self.jitter_max_packets,
        );
        if !(min <= target && target <= max && min < max) {
            return Err(ConfigError::InvalidJitterLevels { min, target, max });
        }

        // Corrections beyond 1% stop being drift correction and become pitch shifting
        let range = self.resampling_range_hz;
        if !range.is_finite() || range <= 0.0 || range > self.sample_rate as f64 * 0.01 {
            return Err(ConfigError::InvalidResamplingRange(range));
        }

        let delay = self.redundancy_delay_ms;
        if !delay.is_finite() || !(0.0..=100.0).contains(&delay) {
            return Err(ConfigError::InvalidRedundancyDelay(delay));
        }

        if self.resampler_taps < 3 || self.resampler_taps > 255 {
            return Err(ConfigError::InvalidFilter(format!(
                "tap count {} outside 3..=255",
                self.resampler_taps
            )));
        }
        if !(self.resampler_cutoff > 0.0 && self.resampler_cutoff < 1.0) {
            return Err(ConfigError::InvalidFilter(format!(
                "cutoff {} outside (0, 1)",
                self.resampler_cutoff
            )));
        }

        if self.reorder_window() < self.jitter_max_packets {
            return Err(ConfigError::InvalidWindow(format!(
                "reorder window {} smaller than max level {}",
                self.reorder_window(),
                self.jitter_max_packets
            )));
        }
        if self.dedup_window() == 0 {
            return Err(ConfigError::InvalidWindow("dedup window is empty".into()));
        }

        if !self.max_output_delay_ms.is_finite() || self.max_output_delay_ms < 0.0 {
            return Err(ConfigError::InvalidWindow(format!(
                "max output delay {} ms",
                self.max_output_delay_ms
            )));
        }

        self.clock.validate()
    }
}

/// Clock recovery controller tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Proportional gain (Hz per packet of error)
    pub kp: f64,
    /// Integral gain (Hz per packet-second)
    pub ki: f64,
    /// Derivative gain (Hz-seconds per packet)
    pub kd: f64,
    /// Weight of the newest sample in the level low-pass filter
    pub level_smoothing: f64,
    /// Distance from target still classified as optimal
    pub tolerance_packets: f64,
    /// Time in a risk state before it is reported as sustained
    pub grace_period_ms: f64,
    /// Number of cycles in the stability variance window
    pub stability_window: usize,
    /// Level variance (packets^2) above which stability decays
    pub variance_threshold: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            kp: 2.0,
            ki: 0.5,
            kd: 0.05,
            level_smoothing: 0.05,
            tolerance_packets: 0.5,
            grace_period_ms: 1000.0,
            stability_window: 64,
            variance_threshold: 1.0,
        }
    }
}

impl ClockConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let gains_ok = [self.kp, self.ki, self.kd]
            .iter()
            .all(|g| g.is_finite() && *g >= 0.0);
        let smoothing_ok = self.level_smoothing > 0.0 && self.level_smoothing <= 1.0;
        if !gains_ok || !smoothing_ok || self.stability_window == 0 {
            return Err(ConfigError::InvalidWindow(format!(
                "clock controller tuning {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local bind address
    pub bind_address: String,
    /// Local UDP port
    pub udp_port: u16,
    /// Receivers every block is sent to
    pub peers: Vec<SocketAddr>,
    /// Socket receive buffer size in bytes
    pub recv_buffer_size: usize,
    /// Socket send buffer size in bytes
    pub send_buffer_size: usize,
    /// Largest UDP payload the path carries without fragmentation
    pub mtu_payload_limit: usize,
    /// Capacity of the network to audio hand-off queue, in blocks
    pub queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            udp_port: DEFAULT_UDP_PORT,
            peers: Vec::new(),
            recv_buffer_size: 1 << 20,
            send_buffer_size: 1 << 20,
            mtu_payload_limit: MAX_PACKET_SIZE,
            queue_capacity: 64,
        }
    }
}

impl NetworkConfig {
    /// Local socket address string
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.udp_port)
    }
}

/// Precision sync (per-device latency) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a latency probe waits for its echo
    pub probe_timeout_ms: u64,
    /// Probe round trips per measurement (median-filtered)
    pub probe_samples: usize,
    /// Interval between alignment re-evaluations
    pub reevaluate_interval_secs: u64,
    /// Common target latency is never below this
    pub latency_floor_ms: f64,
    /// Allowed spread between aligned devices
    pub alignment_tolerance_ms: f64,
    /// This host's own output latency, reported in probe replies
    pub output_latency_ms: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 500,
            probe_samples: 5,
            reevaluate_interval_secs: 10,
            latency_floor_ms: 0.0,
            alignment_tolerance_ms: 2.0,
            output_latency_ms: 0.0,
        }
    }
}

/// Diagnostics HTTP monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_MONITOR_PORT,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub network: NetworkConfig,
    pub sync: SyncConfig,
    pub monitor: MonitorConfig,
}

impl AppConfig {
    /// Parse from a TOML string
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Serialize to a TOML string
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Save(e.to_string()))
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Save configuration to a file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Save(e.to_string()))?;
        }
        std::fs::write(path, self.to_toml()?).map_err(|e| ConfigError::Save(e.to_string()))
    }

    /// Platform config location, e.g. `~/.config/lan-audio-sync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-audio-sync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path` (or the default location), falling back to defaults
    /// when no file exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if path.exists() {
            tracing::info!("Loading config from {}", path.display());
            Self::load(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert_eq!(config.packet_size(), 1040);
        assert!(config.validate(MAX_PACKET_SIZE).is_ok());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let config = SessionConfig {
            sample_rate: 96000,
            frames_per_block: 512,
            channel_count: 2,
            ..Default::default()
        };
        assert_eq!(config.packet_size(), 4112);
        assert_eq!(
            config.validate(MAX_PACKET_SIZE),
            Err(ConfigError::PacketTooLarge {
                size: 4112,
                limit: 1472
            })
        );
    }

    #[test]
    fn test_invalid_rate_and_channels() {
        let config = SessionConfig {
            sample_rate: 12345,
            ..Default::default()
        };
        assert_eq!(
            config.validate(MAX_PACKET_SIZE),
            Err(ConfigError::UnsupportedSampleRate(12345))
        );

        let config = SessionConfig {
            channel_count: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(MAX_PACKET_SIZE),
            Err(ConfigError::InvalidChannels(0))
        );
    }

    #[test]
    fn test_jitter_levels_must_be_ordered() {
        let config = SessionConfig {
            jitter_min_packets: 4,
            jitter_target_packets: 3,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(MAX_PACKET_SIZE),
            Err(ConfigError::InvalidJitterLevels { .. })
        ));
    }

    #[test]
    fn test_windows_scale_with_max_level() {
        let mut config = SessionConfig::default();
        assert_eq!(config.reorder_window(), 24);
        assert_eq!(config.dedup_window(), 48);

        config.reorder_window_packets = Some(10);
        assert_eq!(config.reorder_window(), 10);
    }

    #[test]
    fn test_toml_partial_uses_defaults() {
        let text = r#"
            [session]
            frames_per_block = 64

            [network]
            peers = ["192.168.1.20:55555"]
        "#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.session.frames_per_block, 64);
        assert_eq!(config.session.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.network.peers.len(), 1);
        assert_eq!(config.network.udp_port, DEFAULT_UDP_PORT);
        assert!(!config.monitor.enabled);
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let dir = std::env::temp_dir().join(format!("lan-audio-sync-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.session.channel_count = 1;
        config.sync.latency_floor_ms = 12.5;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = std::fs::remove_dir_all(dir);
    }

    proptest! {
        #[test]
        fn accepted_configs_fit_the_mtu(
            frames in 1usize..1024,
            channels in 1u16..=8,
        ) {
            let config = SessionConfig {
                frames_per_block: frames,
                channel_count: channels,
                ..Default::default()
            };
            if config.validate(MAX_PACKET_SIZE).is_ok() {
                prop_assert!(16 + frames * channels as usize * 4 <= 1472);
            }
        }
    }
}
