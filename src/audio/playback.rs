//! Output device driving the output stage
//!
//! The [`OutputStage`] is moved into the cpal output callback, so every
//! buffer the device asks for is produced in place on the audio thread.
//! The device latency seen there is fed back into the latency the session
//! reports to peers probing it.

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::device::{find_device, negotiate_channels, Direction};
use super::remap_channels;
use crate::config::SessionConfig;
use crate::error::AudioError;
use crate::session::OutputStage;

/// Device buffers up to this size never allocate when channels differ
const MAX_CALLBACK_FRAMES: usize = 4096;

/// Live playback on an output device
pub struct AudioPlayback {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
    /// Hardware output latency reported by the last callback, f64 bits
    output_latency_ms: Arc<AtomicU64>,
    callbacks: Arc<AtomicU64>,
}

impl AudioPlayback {
    /// Open `device_id` (default output when `None`) and start pulling from
    /// `stage`.
    pub fn start(
        device_id: Option<&str>,
        config: &SessionConfig,
        mut stage: OutputStage,
    ) -> Result<Self, AudioError> {
        let device = find_device(device_id, Direction::Output)?;
        let sample_rate = config.sample_rate;
        let session_channels = stage.channels();
        let device_channels =
            negotiate_channels(&device, Direction::Output, sample_rate, config.channel_count)?;
        let stream_config = cpal::StreamConfig {
            channels: device_channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let device_channels = device_channels as usize;

        let running = Arc::new(AtomicBool::new(true));
        let output_latency_ms = Arc::new(AtomicU64::new(0f64.to_bits()));
        let callbacks = Arc::new(AtomicU64::new(0));
        let (error_tx, error_rx) = bounded::<AudioError>(16);

        let running_for_loop = running.clone();
        let latency = output_latency_ms.clone();
        let callback_count = callbacks.clone();

        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let mut scratch = if device_channels == session_channels {
                    Vec::new()
                } else {
                    vec![0.0f32; MAX_CALLBACK_FRAMES * session_channels]
                };

                let stream = device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                        if device_channels == session_channels {
                            stage.process(data);
                        } else {
                            let frames = data.len() / device_channels;
                            if scratch.len() < frames * session_channels {
                                scratch.resize(frames * session_channels, 0.0);
                            }
                            let buf = &mut scratch[..frames * session_channels];
                            stage.process(buf);
                            remap_channels(buf, session_channels, data, device_channels);
                        }

                        let ts = info.timestamp();
                        if let Some(ahead) = ts.playback.duration_since(&ts.callback) {
                            let ms = ahead.as_secs_f64() * 1000.0;
                            latency.store(ms.to_bits(), Ordering::Relaxed);
                            stage.set_device_latency_ms(ms);
                        }
                        callback_count.fetch_add(1, Ordering::Relaxed);
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("Failed to start playback stream: {}", e);
                            running_for_loop.store(false, Ordering::SeqCst);
                            return;
                        }
                        tracing::info!(
                            "Playback running: {} Hz, {} device channels",
                            sample_rate,
                            device_channels
                        );
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to build playback stream: {}", e);
                        running_for_loop.store(false, Ordering::SeqCst);
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            running,
            thread_handle: Some(handle),
            error_rx,
            output_latency_ms,
            callbacks,
        })
    }

    /// Hardware output latency seen by the most recent callback
    pub fn output_latency_ms(&self) -> f64 {
        f64::from_bits(self.output_latency_ms.load(Ordering::Relaxed))
    }

    /// Number of device callbacks served
    pub fn callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    /// Stop playback
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}
