//! Audio capture into fixed-size blocks
//!
//! The device callback delivers whatever buffer size the host picks. A
//! [`BlockAssembler`] cuts that stream into `frames_per_block` blocks in the
//! session's channel layout, which are then handed to the network side over
//! a bounded channel. The stream itself lives on its own thread because
//! cpal streams are not `Send` on every platform.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::device::{find_device, negotiate_channels, Direction};
use super::remap_channels;
use crate::config::SessionConfig;
use crate::error::AudioError;

/// Collects arbitrary-sized interleaved input into fixed blocks
pub struct BlockAssembler {
    device_channels: usize,
    channels: usize,
    frames_per_block: usize,
    pending: Vec<f32>,
    filled: usize,
}

impl BlockAssembler {
    pub fn new(device_channels: u16, channels: u16, frames_per_block: usize) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            device_channels: device_channels.max(1) as usize,
            channels,
            frames_per_block,
            pending: vec![0.0; frames_per_block * channels],
            filled: 0,
        }
    }

    /// Feed device samples; `emit` is called with every completed block
    pub fn push(&mut self, data: &[f32], mut emit: impl FnMut(&[f32])) {
        let mut offset = 0;
        let total_frames = data.len() / self.device_channels;

        while offset < total_frames {
            let room = self.frames_per_block - self.filled;
            let n = room.min(total_frames - offset);
            let src = &data[offset * self.device_channels..(offset + n) * self.device_channels];
            let dst = &mut self.pending[self.filled * self.channels..(self.filled + n) * self.channels];
            remap_channels(src, self.device_channels, dst, self.channels);

            self.filled += n;
            offset += n;
            if self.filled == self.frames_per_block {
                emit(&self.pending);
                self.filled = 0;
            }
        }
    }
}

/// Sine generator standing in for a capture device
pub struct TestTone {
    frequency: f64,
    amplitude: f32,
    sample_rate: f64,
    channels: usize,
    frames_per_block: usize,
    phase: f64,
}

impl TestTone {
    pub fn new(frequency: f64, amplitude: f32, config: &SessionConfig) -> Self {
        Self {
            frequency,
            amplitude,
            sample_rate: config.sample_rate as f64,
            channels: config.channel_count as usize,
            frames_per_block: config.frames_per_block,
            phase: 0.0,
        }
    }

    /// Next block of interleaved samples
    pub fn next_block(&mut self) -> Vec<f32> {
        let step = self.frequency / self.sample_rate;
        let mut block = Vec::with_capacity(self.frames_per_block * self.channels);
        for _ in 0..self.frames_per_block {
            let v = (2.0 * std::f64::consts::PI * self.phase).sin() as f32 * self.amplitude;
            block.extend(std::iter::repeat(v).take(self.channels));
            self.phase = (self.phase + step).fract();
        }
        block
    }

    /// Wall-clock duration of one block
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames_per_block as f64 / self.sample_rate)
    }
}

/// Live capture from an input device
pub struct AudioCapture {
    device_id: Option<String>,
    config: SessionConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    blocks_tx: Sender<Vec<f32>>,
    blocks_rx: Receiver<Vec<f32>>,
    error_rx: Option<Receiver<AudioError>>,
    blocks_captured: Arc<AtomicU64>,
    blocks_dropped: Arc<AtomicU64>,
}

impl AudioCapture {
    /// Prepare capture from `device_id` (default input when `None`).
    /// `queue_blocks` bounds how far the consumer may fall behind.
    pub fn new(device_id: Option<&str>, config: &SessionConfig, queue_blocks: usize) -> Self {
        let (blocks_tx, blocks_rx) = bounded(queue_blocks.max(1));
        Self {
            device_id: device_id.map(str::to_string),
            config: config.clone(),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            blocks_tx,
            blocks_rx,
            error_rx: None,
            blocks_captured: Arc::new(AtomicU64::new(0)),
            blocks_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Completed blocks, in the session's layout
    pub fn blocks(&self) -> Receiver<Vec<f32>> {
        self.blocks_rx.clone()
    }

    /// Start capturing audio
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = find_device(self.device_id.as_deref(), Direction::Input)?;
        let sample_rate = self.config.sample_rate;
        let device_channels =
            negotiate_channels(&device, Direction::Input, sample_rate, self.config.channel_count)?;
        let stream_config = cpal::StreamConfig {
            channels: device_channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let mut assembler = BlockAssembler::new(
            device_channels,
            self.config.channel_count,
            self.config.frames_per_block,
        );
        let running = self.running.clone();
        let blocks_tx = self.blocks_tx.clone();
        let captured = self.blocks_captured.clone();
        let dropped = self.blocks_dropped.clone();

        running.store(true, Ordering::SeqCst);
        let running_for_loop = running.clone();
        let running_for_callback = running.clone();

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running_for_callback.load(Ordering::Relaxed) {
                            return;
                        }
                        assembler.push(data, |block| {
                            match blocks_tx.try_send(block.to_vec()) {
                                Ok(()) => captured.fetch_add(1, Ordering::Relaxed),
                                Err(_) => dropped.fetch_add(1, Ordering::Relaxed),
                            };
                        });
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start capture stream: {}", e);
                            running_for_loop.store(false, Ordering::SeqCst);
                            return;
                        }
                        tracing::info!(
                            "Capture running: {} Hz, {} device channels",
                            sample_rate,
                            device_channels
                        );
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to build capture stream: {}", e);
                        running_for_loop.store(false, Ordering::SeqCst);
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Blocks handed to the consumer and blocks dropped because it lagged
    pub fn counts(&self) -> (u64, u64) {
        (
            self.blocks_captured.load(Ordering::Relaxed),
            self.blocks_dropped.load(Ordering::Relaxed),
        )
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembles_fixed_blocks_across_callbacks() {
        let mut assembler = BlockAssembler::new(2, 2, 4);
        let mut blocks = Vec::new();

        // 3 + 3 + 2 frames -> two blocks of 4
        let samples: Vec<f32> = (0..16).map(|v| v as f32).collect();
        for chunk in [&samples[..6], &samples[6..12], &samples[12..]] {
            assembler.push(chunk, |b| blocks.push(b.to_vec()));
        }

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], samples[..8].to_vec());
        assert_eq!(blocks[1], samples[8..].to_vec());
    }

    #[test]
    fn test_mono_device_feeds_stereo_session() {
        let mut assembler = BlockAssembler::new(1, 2, 2);
        let mut blocks = Vec::new();
        assembler.push(&[0.25, -0.25, 0.5], |b| blocks.push(b.to_vec()));
        assert_eq!(blocks, vec![vec![0.25, 0.25, -0.25, -0.25]]);
    }

    #[test]
    fn test_tone_is_continuous() {
        let config = SessionConfig::default();
        let mut tone = TestTone::new(1000.0, 0.5, &config);
        let a = tone.next_block();
        let b = tone.next_block();
        assert_eq!(a.len(), 256);

        // Left channel step across the block boundary matches a step inside it
        let inner = (a[254] - a[252]).abs();
        let boundary = (b[0] - a[254]).abs();
        assert!((inner - boundary).abs() < 0.05);
        assert!(a.iter().chain(&b).all(|s| s.abs() <= 0.5));
        assert_eq!(tone.block_duration(), Duration::from_secs_f64(128.0 / 48000.0));
    }
}
