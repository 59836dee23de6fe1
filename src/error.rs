//! Error types for the audio sync core
//!
//! Only configuration errors abort a session. Transient network faults and
//! malformed packets are counted by the component that sees them and never
//! surface here.

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Output stage has been moved to the audio thread")]
    OutputDetached,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal session configuration errors, raised at session open
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Packet too large: {size} bytes exceeds the {limit} byte payload limit")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("Invalid frames per block: {0}")]
    InvalidFramesPerBlock(usize),

    #[error("Invalid jitter levels: min {min}, target {target}, max {max}")]
    InvalidJitterLevels {
        min: usize,
        target: usize,
        max: usize,
    },

    #[error("Invalid resampling range: {0} Hz")]
    InvalidResamplingRange(f64),

    #[error("Invalid redundancy delay: {0} ms")]
    InvalidRedundancyDelay(f64),

    #[error("Invalid resampler filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid window size: {0}")]
    InvalidWindow(String),

    #[error("Failed to read config: {0}")]
    Load(String),

    #[error("Failed to write config: {0}")]
    Save(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid block: expected {expected} samples, got {actual}")]
    InvalidBlock { expected: usize, actual: usize },

    #[error("No peers configured")]
    NoPeers,
}

/// Audio device errors (host side only)
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
