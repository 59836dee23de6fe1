//! Signal processing for the output path

pub mod delay;
pub mod filter;
pub mod resampler;

pub use delay::{DelayControl, DelayLine, SharedDelayControl};
pub use filter::FirFilter;
pub use resampler::Resampler;
