//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod jitter;
pub mod playback;

pub use buffer::{create_shared_queue, AudioBlock, BlockQueue, SharedBlockQueue};
pub use capture::{AudioCapture, BlockAssembler, TestTone};
pub use device::{find_device, list_devices, AudioDeviceInfo, Direction};
pub use jitter::{BufferHealth, JitterBuffer, JitterConfig};
pub use playback::AudioPlayback;

/// Copy interleaved frames between channel layouts. Mono is spread to every
/// output channel; otherwise channels map by index and extra outputs are
/// silent. Converts `min(src, dst)` frames and returns that count.
pub fn remap_channels(src: &[f32], src_channels: usize, dst: &mut [f32], dst_channels: usize) -> usize {
    let frames = (src.len() / src_channels).min(dst.len() / dst_channels);
    for (s, d) in src
        .chunks_exact(src_channels)
        .zip(dst.chunks_exact_mut(dst_channels))
        .take(frames)
    {
        if src_channels == 1 {
            d.fill(s[0]);
        } else {
            for (c, out) in d.iter_mut().enumerate() {
                *out = s.get(c).copied().unwrap_or(0.0);
            }
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_channels() {
        let mut stereo = [0.0; 4];
        assert_eq!(remap_channels(&[0.5, -0.5], 1, &mut stereo, 2), 2);
        assert_eq!(stereo, [0.5, 0.5, -0.5, -0.5]);

        let mut mono = [0.0; 2];
        remap_channels(&[0.1, 0.2, 0.3, 0.4], 2, &mut mono, 1);
        assert_eq!(mono, [0.1, 0.3]);

        let mut quad = [9.0; 4];
        remap_channels(&[0.1, 0.2], 2, &mut quad, 4);
        assert_eq!(quad, [0.1, 0.2, 0.0, 0.0]);
    }
}
