//! Clock recovery and cross-device alignment

pub mod clock;
pub mod precision;
pub mod probe;
pub mod ticker;

pub use clock::{ClockRecoveryController, ClockSnapshot, ClockState};
pub use precision::{
    calibration_sweep, estimate_latency_from_tone, AlignmentReport, DeviceSyncProfile,
    PrecisionSyncEngine,
};
pub use probe::{LatencyProbe, OutputLatency, ProbeState, ProbeStep, SharedOutputLatency};
pub use ticker::Ticker;
