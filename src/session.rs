//! Streaming session
//!
//! A [`Session`] owns one UDP socket and everything hanging off it: the
//! redundant sender, the receive task, the hand-off queue, the output
//! stage and the precision sync engine. Every session can both send and
//! receive; a pure sender simply never pulls output and a pure receiver
//! never sends blocks.
//!
//! The output path lives in [`OutputStage`]. A real-time host moves it onto
//! its audio thread with [`Session::take_output`]; simpler hosts and tests
//! call [`Session::pull_output_block`] instead.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::buffer::{create_shared_queue, SharedBlockQueue};
use crate::audio::jitter::{BufferHealth, JitterBuffer, JitterBufferStats, JitterConfig};
use crate::config::{NetworkConfig, SessionConfig, SyncConfig};
use crate::dsp::delay::{DelayControl, DelayLine, SharedDelayControl};
use crate::dsp::resampler::{Resampler, ResamplerStats};
use crate::error::{Error, Result};
use crate::network::receiver::{AudioReceiver, ControlReplies, ReceiverStats, ReceiverStatsSnapshot};
use crate::network::sender::{AudioSender, SenderStatsSnapshot};
use crate::network::udp::{bind_addr, create_socket};
use crate::protocol::{ControlPacket, PacketLayout};
use crate::sync::clock::{ClockRecoveryController, ClockSnapshot};
use crate::sync::precision::{AlignmentReport, PrecisionSyncEngine};
use crate::sync::probe::{LatencyProbe, OutputLatency, ProbeStep, SharedOutputLatency};

/// Callback sizes up to this many frames never allocate
const PREALLOCATED_CALLBACK_FRAMES: usize = 4096;

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

/// Control-loop scalars written by the audio path, read by anyone
#[derive(Debug)]
pub struct SharedDiagnostics {
    current_sample_rate: AtomicU64,
    adjustment_hz: AtomicU64,
    drift_ppm: AtomicU64,
    stability_score: AtomicU64,
    level_packets: AtomicU64,
    smoothed_level: AtomicU64,
    health: AtomicU8,
    degraded: AtomicBool,
    cycles: AtomicU64,
    lost: AtomicU64,
    late: AtomicU64,
    underruns: AtomicU64,
    overflow_drops: AtomicU64,
    resyncs: AtomicU64,
    silent_frames: AtomicU64,
    starved_frames: AtomicU64,
}

impl SharedDiagnostics {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            current_sample_rate: AtomicU64::new((sample_rate as f64).to_bits()),
            adjustment_hz: AtomicU64::new(0f64.to_bits()),
            drift_ppm: AtomicU64::new(0f64.to_bits()),
            stability_score: AtomicU64::new(1f64.to_bits()),
            level_packets: AtomicU64::new(0f64.to_bits()),
            smoothed_level: AtomicU64::new(0f64.to_bits()),
            health: AtomicU8::new(BufferHealth::UnderflowRisk.as_u8()),
            degraded: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            late: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            overflow_drops: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            silent_frames: AtomicU64::new(0),
            starved_frames: AtomicU64::new(0),
        }
    }

    /// Publish the results of one output cycle
    fn publish(&self, clock: &ClockSnapshot, jitter: &JitterBufferStats, resampler: &ResamplerStats) {
        store_f64(&self.current_sample_rate, clock.current_sample_rate);
        store_f64(&self.adjustment_hz, clock.adjustment_hz);
        store_f64(&self.drift_ppm, clock.drift_ppm);
        store_f64(&self.stability_score, clock.stability_score);
        store_f64(&self.level_packets, jitter.level_packets);
        store_f64(&self.smoothed_level, jitter.smoothed_level);
        self.health.store(clock.health.as_u8(), Ordering::Relaxed);
        self.degraded.store(clock.degraded, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.lost.store(jitter.lost, Ordering::Relaxed);
        self.late.store(jitter.late, Ordering::Relaxed);
        self.underruns.store(jitter.underruns, Ordering::Relaxed);
        self.overflow_drops.store(jitter.overflow_drops, Ordering::Relaxed);
        self.resyncs.store(jitter.resyncs, Ordering::Relaxed);
        self.silent_frames.store(jitter.silent_frames, Ordering::Relaxed);
        self.starved_frames
            .store(resampler.starved_frames, Ordering::Relaxed);
    }

    pub fn health(&self) -> BufferHealth {
        BufferHealth::from_u8(self.health.load(Ordering::Relaxed))
    }

    pub fn level_packets(&self) -> f64 {
        load_f64(&self.level_packets)
    }

    pub fn counters(&self) -> OutputCounters {
        OutputCounters {
            cycles: self.cycles.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            silent_frames: self.silent_frames.load(Ordering::Relaxed),
            starved_frames: self.starved_frames.load(Ordering::Relaxed),
        }
    }
}

/// Output path counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OutputCounters {
    pub cycles: u64,
    pub lost: u64,
    pub late: u64,
    pub underruns: u64,
    pub overflow_drops: u64,
    pub resyncs: u64,
    pub silent_frames: u64,
    pub starved_frames: u64,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub session_id: Uuid,
    pub drift_ppm: f64,
    pub buffer_health: BufferHealth,
    pub stability_score: f64,
    pub current_sample_rate: f64,
    pub adjustment_hz: f64,
    pub level_packets: f64,
    pub smoothed_level: f64,
    /// A risk state has outlasted the grace period
    pub degraded: bool,
    pub applied_delay_ms: f64,
    pub applied_gain: f64,
    pub output: OutputCounters,
    pub transport: ReceiverStatsSnapshot,
    pub sender: SenderStatsSnapshot,
}

/// Receive-side processing run once per audio callback:
/// queue -> jitter buffer -> clock recovery -> resampler -> delay line.
pub struct OutputStage {
    queue: SharedBlockQueue,
    jitter: JitterBuffer,
    clock: ClockRecoveryController,
    resampler: Resampler,
    delay_line: DelayLine,
    delay: SharedDelayControl,
    diagnostics: Arc<SharedDiagnostics>,
    output_latency: SharedOutputLatency,
    channels: usize,
    sample_rate: f64,
    /// Jitter buffer output, sized for the largest expected callback
    scratch: Vec<f32>,
    shut_down: bool,
}

impl OutputStage {
    pub fn new(
        config: &SessionConfig,
        queue: SharedBlockQueue,
        delay: SharedDelayControl,
        diagnostics: Arc<SharedDiagnostics>,
    ) -> Self {
        let channels = config.channel_count as usize;
        let resampler = Resampler::new(
            config.channel_count,
            config.sample_rate,
            config.resampling_range_hz,
            config.resampler_taps,
            config.resampler_cutoff,
        );
        let scratch_frames = resampler.max_frames_needed(PREALLOCATED_CALLBACK_FRAMES);

        // Buffering at the target level plus the resampler
        let jitter_frames = (config.jitter_target_packets * config.frames_per_block) as f64;
        let stage_ms =
            (jitter_frames + resampler.latency_frames()) * 1000.0 / config.sample_rate as f64;

        Self {
            queue,
            jitter: JitterBuffer::new(JitterConfig::from_session(config)),
            clock: ClockRecoveryController::new(config),
            resampler,
            delay_line: DelayLine::new(
                config.channel_count,
                config.sample_rate,
                config.max_output_delay_ms,
            ),
            delay,
            diagnostics,
            output_latency: Arc::new(OutputLatency::new(stage_ms, 0.0)),
            channels,
            sample_rate: config.sample_rate as f64,
            scratch: vec![0.0; scratch_frames * channels],
            shut_down: false,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Latency added by buffering at the target level plus the resampler
    pub fn latency_ms(&self) -> f64 {
        self.output_latency.stage_ms()
    }

    /// Latency reported to peers that probe this session
    pub fn output_latency(&self) -> SharedOutputLatency {
        self.output_latency.clone()
    }

    /// Record the device latency seen by the audio callback
    pub fn set_device_latency_ms(&self, device_ms: f64) {
        self.output_latency.set_device_ms(device_ms);
    }

    /// Fill `out` (interleaved) with the next output frames. Bounded time,
    /// no blocking, and no allocation for callbacks up to 4096 frames.
    pub fn process(&mut self, out: &mut [f32]) {
        if self.queue.is_closed() {
            self.shutdown();
            out.fill(0.0);
            return;
        }

        // The queue is bounded, so this loop is too
        while let Some(block) = self.queue.pop() {
            self.jitter.push(block);
        }

        let frames = out.len() / self.channels;
        if frames == 0 {
            return;
        }
        let dt = frames as f64 / self.sample_rate;

        let rate = self.clock.update(self.jitter.smoothed_level(), dt);
        self.resampler.set_output_rate(rate);

        let needed = self.resampler.frames_needed(frames) * self.channels;
        if needed > self.scratch.len() {
            tracing::warn!("Callback of {} frames exceeds preallocated scratch", frames);
            self.scratch.resize(needed, 0.0);
        }
        let input = &mut self.scratch[..needed];
        self.jitter.pull_into(input);
        self.resampler.process(input, out);

        self.delay_line.set(self.delay.delay_ms(), self.delay.gain());
        self.delay_line.process(out);

        self.diagnostics.publish(
            &self.clock.snapshot(),
            &self.jitter.stats(),
            &self.resampler.stats(),
        );
    }

    /// Allocate and fill one output block of `frame_count` frames
    pub fn pull(&mut self, frame_count: usize) -> Vec<f32> {
        let mut out = vec![0.0; frame_count * self.channels];
        self.process(&mut out);
        out
    }

    /// Discard buffered audio and filter state. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.queue.drain();
        self.jitter.reset();
        self.resampler.reset();
        self.delay_line.reset();
        self.clock.reset();
        tracing::debug!("Output stage released");
    }
}

/// One streaming session
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    local_addr: SocketAddr,
    sender: AudioSender,
    queue: SharedBlockQueue,
    delay: SharedDelayControl,
    diagnostics: Arc<SharedDiagnostics>,
    receiver_stats: Arc<ReceiverStats>,
    engine: Arc<PrecisionSyncEngine>,
    replies: tokio::sync::Mutex<ControlReplies>,
    output: Mutex<Option<OutputStage>>,
    last_alignment: RwLock<Option<AlignmentReport>>,
    cancel: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    opened_at: DateTime<Utc>,
}

impl Session {
    /// Validate the configuration, bind the socket and start receiving.
    /// Configuration errors are fatal here and never discovered later.
    pub async fn open(config: SessionConfig, network: NetworkConfig, sync: SyncConfig) -> Result<Self> {
        config.validate(network.mtu_payload_limit)?;

        let addr = bind_addr(&network)?;
        let socket = Arc::new(create_socket(addr, &network)?);
        let local_addr = socket.local_addr()?;
        let layout = PacketLayout::from_config(&config);

        let queue = create_shared_queue(network.queue_capacity);
        let delay: SharedDelayControl = Arc::new(DelayControl::new());
        let diagnostics = Arc::new(SharedDiagnostics::new(config.sample_rate));
        let output = OutputStage::new(&config, queue.clone(), delay.clone(), diagnostics.clone());
        let output_latency = output.output_latency();
        output_latency.set_device_ms(sync.output_latency_ms);

        let (receiver, replies) = AudioReceiver::new(
            socket.clone(),
            layout,
            config.dedup_window(),
            queue.clone(),
            delay.clone(),
            output_latency,
        );
        let receiver_stats = receiver.stats();
        let cancel = CancellationToken::new();
        let receive_task = receiver.spawn(cancel.clone());

        let sender = AudioSender::new(socket, layout, network.peers.clone(), config.redundancy_delay_ms);

        let engine = Arc::new(PrecisionSyncEngine::new(sync, config.max_output_delay_ms));
        for peer in &network.peers {
            engine.add_device(&peer.to_string());
        }

        let id = Uuid::new_v4();
        tracing::info!(
            "Session {} open on {}: {} Hz, {} ch, {} frames/block ({} byte packets), {} peers",
            id,
            local_addr,
            config.sample_rate,
            config.channel_count,
            config.frames_per_block,
            config.packet_size(),
            network.peers.len()
        );

        Ok(Self {
            id,
            config,
            local_addr,
            sender,
            queue,
            delay,
            diagnostics,
            receiver_stats,
            engine,
            replies: tokio::sync::Mutex::new(replies),
            output: Mutex::new(Some(output)),
            last_alignment: RwLock::new(None),
            cancel,
            receive_task: Mutex::new(Some(receive_task)),
            opened_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.sender.peers()
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Device profiles and alignment state
    pub fn engine(&self) -> Arc<PrecisionSyncEngine> {
        self.engine.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start sending to another receiver
    pub fn add_peer(&self, peer: SocketAddr) {
        self.sender.add_peer(peer);
        self.engine.add_device(&peer.to_string());
    }

    /// Stop sending to a receiver and forget its profile
    pub fn remove_peer(&self, peer: SocketAddr) {
        self.sender.remove_peer(peer);
        self.engine.remove_device(&peer.to_string());
    }

    /// Send one block of interleaved PCM (`frames_per_block * channels`
    /// samples) to every peer. Returns the id it was sent under.
    pub async fn send_block(&self, pcm: &[f32]) -> Result<u64> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        Ok(self.sender.send_block(pcm).await?)
    }

    /// Produce exactly `frame_count` frames of output. Always full length;
    /// missing audio is silence.
    pub fn pull_output_block(&self, frame_count: usize) -> Result<Vec<f32>> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        match self.output.lock().as_mut() {
            Some(stage) => Ok(stage.pull(frame_count)),
            None => Err(Error::OutputDetached),
        }
    }

    /// Move the output stage to the caller, typically an audio callback
    pub fn take_output(&self) -> Option<OutputStage> {
        self.output.lock().take()
    }

    /// Get diagnostics
    pub fn diagnostics(&self) -> Diagnostics {
        let d = &self.diagnostics;
        Diagnostics {
            session_id: self.id,
            drift_ppm: load_f64(&d.drift_ppm),
            buffer_health: d.health(),
            stability_score: load_f64(&d.stability_score),
            current_sample_rate: load_f64(&d.current_sample_rate),
            adjustment_hz: load_f64(&d.adjustment_hz),
            level_packets: d.level_packets(),
            smoothed_level: load_f64(&d.smoothed_level),
            degraded: d.degraded.load(Ordering::Relaxed),
            applied_delay_ms: self.delay.delay_ms(),
            applied_gain: self.delay.gain(),
            output: d.counters(),
            transport: self.receiver_stats.snapshot(),
            sender: self.sender.stats().snapshot(),
        }
    }

    /// Measure one peer's end-to-end latency with timed echo probes. A
    /// timeout falls back to the previous measurement (or zero) and is
    /// recorded as such; it is not an error.
    pub async fn measure_latency(&self, peer: SocketAddr) -> Result<f64> {
        let sync = self.engine.config();
        let device_id = peer.to_string();
        let mut replies = self.replies.lock().await;

        // Replies from an earlier, abandoned round
        while replies.try_recv().is_ok() {}

        let mut probe = LatencyProbe::new(
            Duration::from_millis(sync.probe_timeout_ms),
            sync.probe_samples,
        );
        if let Some(previous) = self.engine.profile(&device_id).filter(|p| p.measured_at.is_some()) {
            probe = probe.with_previous(previous.measured_latency_ms);
        }

        let mut step = probe.begin(Instant::now());
        loop {
            match step {
                ProbeStep::Send(request) => {
                    if let Err(e) = self.sender.send_control(peer, &request).await {
                        tracing::debug!("Probe send failed: {}", e);
                    }
                    step = ProbeStep::Waiting;
                }
                ProbeStep::Complete(latency_ms) => {
                    self.engine.record_latency(&device_id, latency_ms);
                    return Ok(latency_ms);
                }
                ProbeStep::TimedOut(fallback_ms) => {
                    self.engine.record_timeout(&device_id, fallback_ms);
                    return Ok(fallback_ms);
                }
                ProbeStep::Waiting => {
                    let wait = probe.remaining(Instant::now()).unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::SessionClosed),
                        _ = tokio::time::sleep(wait) => step = probe.poll(Instant::now()),
                        reply = replies.recv() => match reply {
                            Some((from, packet)) if from == peer => {
                                step = probe.on_reply(&packet, Instant::now());
                            }
                            Some(_) => {}
                            None => return Err(Error::SessionClosed),
                        },
                    }
                }
            }
        }
    }

    /// Tell a peer which output delay and gain to apply
    pub async fn assign_delay(&self, peer: SocketAddr, delay_ms: f64, gain: f64) -> Result<()> {
        let packet = ControlPacket::AssignDelay {
            delay_ms,
            gain: gain as f32,
        };
        Ok(self.sender.send_control(peer, &packet).await?)
    }

    /// Measure every peer, realign, and push the resulting delays out
    pub async fn synchronize(&self) -> Result<Option<AlignmentReport>> {
        for peer in self.peers() {
            self.measure_latency(peer).await?;
        }

        let Some(report) = self.engine.evaluate() else {
            return Ok(None);
        };

        for device in &report.devices {
            let Ok(peer) = device.device_id.parse::<SocketAddr>() else {
                continue;
            };
            if let Err(e) = self
                .assign_delay(peer, device.applied_delay_ms, device.applied_gain)
                .await
            {
                tracing::warn!("Could not assign delay to {}: {}", peer, e);
            }
        }

        tracing::info!(
            "Synchronized {} devices at {:.2} ms (spread {:.2} ms)",
            report.devices.len(),
            report.target_latency_ms,
            report.spread_ms
        );
        *self.last_alignment.write() = Some(report.clone());
        Ok(Some(report))
    }

    /// Result of the most recent [`Session::synchronize`]
    pub fn last_alignment(&self) -> Option<AlignmentReport> {
        self.last_alignment.read().clone()
    }

    /// Tear down: stop the receive task, then discard queued and buffered
    /// audio. A detached output stage sees the closed queue and goes silent.
    pub async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Receive task ended abnormally: {}", e);
            }
        }

        self.queue.close();
        if let Some(stage) = self.output.lock().as_mut() {
            stage.shutdown();
        }
        tracing::info!("Session {} closed", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
    }
}
