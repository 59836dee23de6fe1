//! # LAN Audio Sync
//!
//! Low-latency PCM audio streaming over best-effort UDP with receiver-side
//! clock recovery.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SENDER ────────────────────────────────┐
//! │  Capture (audio::capture) ──► fixed PCM blocks ──► Session::send_block  │
//! │                                                        │                │
//! │                          AudioSender (network::sender) │                │
//! │             [id u64 LE | timestamp f64 LE | f32 PCM]   ▼                │
//! │                 transmitted twice, second copy +1 ms ──────────┐        │
//! └────────────────────────────────────────────────────────────────┼────────┘
//!                                                 UDP over LAN     │
//! ┌──────────────────────────────── RECEIVER ──────────────────────┼────────┐
//! │  AudioReceiver (network::receiver)  ◄──────────────────────────┘        │
//! │     validate length ─► DedupWindow ─► BlockQueue (lock-free SPSC)       │
//! │                                             │                           │
//! │  ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ network path │ audio path ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─    │
//! │                                             ▼                           │
//! │  OutputStage (session) on every audio callback:                        │
//! │     JitterBuffer ──level──► ClockRecoveryController (PID)              │
//! │          │                          │ rate offset (±20 Hz)              │
//! │          ▼                          ▼                                   │
//! │      PCM frames ───────────► Resampler (windowed sinc) ──► DelayLine    │
//! │                                                              │          │
//! │  PrecisionSyncEngine ── appliedDelayMs / appliedGain ────────┘          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod dsp;
pub mod error;
pub mod monitor;
pub mod network;
pub mod protocol;
pub mod session;
pub mod sync;

pub use error::{Error, Result};
pub use session::{Diagnostics, OutputStage, Session};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default frames per block (2.67 ms at 48 kHz)
    pub const DEFAULT_FRAMES_PER_BLOCK: usize = 128;

    /// Default UDP port for audio streaming
    pub const DEFAULT_UDP_PORT: u16 = 55555;

    /// Default HTTP port for the diagnostics monitor
    pub const DEFAULT_MONITOR_PORT: u16 = 8080;

    /// Maximum UDP payload for the default network class
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Packet header: 8 byte id + 8 byte timestamp
    pub const PACKET_HEADER_SIZE: usize = 16;

    /// Bytes per PCM sample on the wire (f32)
    pub const BYTES_PER_SAMPLE: usize = 4;

    /// Delay between the two redundant transmissions
    pub const DEFAULT_REDUNDANCY_DELAY_MS: f64 = 1.0;

    /// Jitter buffer target level in packets
    pub const DEFAULT_JITTER_TARGET_PACKETS: usize = 3;

    /// Jitter buffer minimum level in packets
    pub const DEFAULT_JITTER_MIN_PACKETS: usize = 1;

    /// Jitter buffer maximum level in packets
    pub const DEFAULT_JITTER_MAX_PACKETS: usize = 6;

    /// Maximum rate correction around the nominal rate
    pub const DEFAULT_RESAMPLING_RANGE_HZ: f64 = 20.0;

    /// Sample rates accepted by session validation
    pub const SUPPORTED_SAMPLE_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

    /// Maximum channel count
    pub const MAX_CHANNELS: u16 = 8;
}
