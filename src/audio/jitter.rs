//! Adaptive jitter buffer
//!
//! Turns irregular packet arrival into frames on demand. Blocks are slotted
//! by id (modulo the reorder window) so late-but-not-too-late arrivals land
//! in order, and reads are frame granular so the audio callback size does
//! not have to match the packet size.
//!
//! Owned by the audio path only. The network path reaches it through the
//! lock-free [`BlockQueue`](crate::audio::buffer::BlockQueue).

use serde::Serialize;

use crate::audio::buffer::AudioBlock;
use crate::config::SessionConfig;

/// Buffer health relative to the configured levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BufferHealth {
    UnderflowRisk,
    Stable,
    Optimal,
    OverflowRisk,
}

impl BufferHealth {
    /// Classify a level (in packets) against min/target/max
    pub fn classify(level: f64, min: f64, target: f64, max: f64, tolerance: f64) -> Self {
        if level < min {
            BufferHealth::UnderflowRisk
        } else if level > max {
            BufferHealth::OverflowRisk
        } else if (level - target).abs() <= tolerance {
            BufferHealth::Optimal
        } else {
            BufferHealth::Stable
        }
    }

    pub fn is_risk(&self) -> bool {
        matches!(self, BufferHealth::UnderflowRisk | BufferHealth::OverflowRisk)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            BufferHealth::UnderflowRisk => 0,
            BufferHealth::Stable => 1,
            BufferHealth::Optimal => 2,
            BufferHealth::OverflowRisk => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => BufferHealth::UnderflowRisk,
            2 => BufferHealth::Optimal,
            3 => BufferHealth::OverflowRisk,
            _ => BufferHealth::Stable,
        }
    }
}

/// Jitter buffer geometry and level policy
#[derive(Debug, Clone)]
pub struct JitterConfig {
    pub frames_per_block: usize,
    pub channels: u16,
    pub target_packets: usize,
    pub min_packets: usize,
    pub max_packets: usize,
    /// Slots available for out-of-order arrivals
    pub reorder_window: usize,
    /// Weight of the newest level in the smoothed estimate
    pub smoothing: f64,
    /// Distance from target, in packets, still counted as optimal
    pub tolerance_packets: f64,
}

impl JitterConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            frames_per_block: config.frames_per_block,
            channels: config.channel_count,
            target_packets: config.jitter_target_packets,
            min_packets: config.jitter_min_packets,
            max_packets: config.jitter_max_packets,
            reorder_window: config.reorder_window(),
            smoothing: config.clock.level_smoothing,
            tolerance_packets: config.clock.tolerance_packets,
        }
    }
}

/// What happened to a pushed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Its slot has already been played
    Late,
    Duplicate,
    /// Wrong sample count for the negotiated layout
    Malformed,
    /// Arrived outside the reorder window (far ahead, far behind, or after
    /// too many late blocks in a row); buffered blocks were discarded and
    /// playback restarts at this id
    Resynced { discarded: usize },
}

/// Counters reported through diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct JitterBufferStats {
    pub level_packets: f64,
    pub smoothed_level: f64,
    pub received: u64,
    pub late: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub lost: u64,
    pub underruns: u64,
    pub overflow_drops: u64,
    pub resyncs: u64,
    pub silent_frames: u64,
}

/// Reordering, level-tracking jitter buffer
pub struct JitterBuffer {
    config: JitterConfig,
    /// Blocks waiting to be played, indexed by id % reorder_window
    slots: Vec<Option<AudioBlock>>,
    /// Occupied slots
    buffered: usize,
    /// Id of the next block to start playing
    next_id: Option<u64>,
    /// Block currently being read and the read position in frames
    current: Option<AudioBlock>,
    read_pos: usize,
    /// Silence still owed for a lost block
    concealing: usize,
    /// Playback has reached the target level at least once since the last drain
    primed: bool,
    /// Consecutive late pushes
    late_run: usize,
    smoothed_level: f64,
    stats: JitterBufferStats,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        let capacity = config.reorder_window.max(config.max_packets + 1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            config,
            slots,
            buffered: 0,
            next_id: None,
            current: None,
            read_pos: 0,
            concealing: 0,
            primed: false,
            late_run: 0,
            smoothed_level: 0.0,
            stats: JitterBufferStats::default(),
        }
    }

    fn block_samples(&self) -> usize {
        self.config.frames_per_block * self.config.channels as usize
    }

    fn slot_index(&self, id: u64) -> usize {
        (id % self.slots.len() as u64) as usize
    }

    /// Insert a block at its id position
    pub fn push(&mut self, block: AudioBlock) -> PushOutcome {
        if block.samples.len() != self.block_samples() {
            self.stats.malformed += 1;
            return PushOutcome::Malformed;
        }

        let id = block.id;
        let next = *self.next_id.get_or_insert(id);
        let window = self.slots.len() as u64;

        let mut outcome = PushOutcome::Accepted;
        if id < next {
            // A sender that restarted its id counter lands far behind the
            // cursor, or keeps arriving just behind it
            self.late_run += 1;
            if next - id < window && self.late_run <= self.slots.len() {
                self.stats.late += 1;
                tracing::trace!("Dropping late block {} (next {})", id, next);
                return PushOutcome::Late;
            }
            outcome = self.resync(id, next);
        } else if id - next >= window {
            outcome = self.resync(id, next);
        }
        self.late_run = 0;

        let index = self.slot_index(id);
        match &self.slots[index] {
            Some(existing) if existing.id == id => {
                self.stats.duplicates += 1;
                return PushOutcome::Duplicate;
            }
            Some(_) => {
                // Stale occupant from before the cursor; the new block wins
                self.buffered -= 1;
            }
            None => {}
        }

        self.slots[index] = Some(block);
        self.buffered += 1;
        self.stats.received += 1;

        self.trim_overflow();
        outcome
    }

    /// Drop the oldest audio until the level is back at the maximum
    fn trim_overflow(&mut self) {
        let max_frames = self.config.max_packets * self.config.frames_per_block;
        let mut dropped = 0;

        while self.level_frames() > max_frames {
            if self.current.take().is_some() || self.concealing > 0 {
                self.read_pos = 0;
                self.concealing = 0;
            } else if !self.skip_to_next_buffered() {
                break;
            }
            dropped += 1;
        }

        if dropped > 0 {
            self.stats.overflow_drops += dropped;
            tracing::debug!(
                "Jitter buffer overflow, dropped {} oldest blocks (level {:.2})",
                dropped,
                self.level_packets()
            );
        }
    }

    /// Remove the oldest buffered block, skipping empty slots before it.
    fn skip_to_next_buffered(&mut self) -> bool {
        if self.buffered == 0 {
            return false;
        }
        let Some(mut id) = self.next_id else {
            return false;
        };
        for _ in 0..self.slots.len() {
            let index = self.slot_index(id);
            id += 1;
            if self.slots[index].take().is_some() {
                self.buffered -= 1;
                self.next_id = Some(id);
                return true;
            }
        }
        self.next_id = Some(id);
        false
    }

    /// Restart playback at `id`, discarding everything buffered
    fn resync(&mut self, id: u64, next: u64) -> PushOutcome {
        let discarded = self.clear_slots();
        self.next_id = Some(id);
        self.stats.resyncs += 1;
        tracing::debug!(
            "Block {} outside reorder window (next {}), resyncing and discarding {}",
            id,
            next,
            discarded
        );
        PushOutcome::Resynced { discarded }
    }

    fn clear_slots(&mut self) -> usize {
        let discarded = self.buffered;
        for slot in &mut self.slots {
            *slot = None;
        }
        self.buffered = 0;
        discarded
    }

    /// Fill `out` (interleaved, `frame_count * channels` samples) with the
    /// next frames. Never blocks: missing audio becomes silence. Returns the
    /// number of frames that carried real audio.
    pub fn pull_into(&mut self, out: &mut [f32]) -> usize {
        let channels = self.config.channels as usize;
        let frame_count = out.len() / channels;
        let block_frames = self.config.frames_per_block;

        if !self.primed {
            if self.level_frames() >= self.config.target_packets * block_frames {
                self.primed = true;
                tracing::debug!("Jitter buffer primed at {:.2} packets", self.level_packets());
            } else {
                out.fill(0.0);
                self.stats.silent_frames += frame_count as u64;
                self.update_smoothed();
                return 0;
            }
        }

        let mut written = 0;
        let mut audible = 0;

        while written < frame_count {
            let wanted = frame_count - written;

            if self.concealing > 0 {
                let n = wanted.min(self.concealing);
                out[written * channels..(written + n) * channels].fill(0.0);
                self.concealing -= n;
                self.stats.silent_frames += n as u64;
                written += n;
                continue;
            }

            if let Some(block) = &self.current {
                let remaining = block_frames - self.read_pos;
                if remaining > 0 {
                    let n = wanted.min(remaining);
                    let src = &block.samples[self.read_pos * channels..(self.read_pos + n) * channels];
                    out[written * channels..(written + n) * channels].copy_from_slice(src);
                    self.read_pos += n;
                    written += n;
                    audible += n;
                    continue;
                }
                self.current = None;
                self.read_pos = 0;
            }

            if !self.advance() {
                out[written * channels..].fill(0.0);
                self.stats.silent_frames += (frame_count - written) as u64;
                self.stats.underruns += 1;
                self.primed = false;
                break;
            }
        }

        self.update_smoothed();
        audible
    }

    /// Convenience wrapper returning a freshly allocated block
    pub fn pull(&mut self, frame_count: usize) -> Vec<f32> {
        let mut out = vec![0.0; frame_count * self.config.channels as usize];
        self.pull_into(&mut out);
        out
    }

    /// Move to the next block id. A missing block followed by buffered audio
    /// is concealed with one block of silence. Returns false on underrun.
    fn advance(&mut self) -> bool {
        let Some(id) = self.next_id else {
            return false;
        };
        if self.buffered == 0 {
            return false;
        }

        let index = self.slot_index(id);
        self.next_id = Some(id + 1);
        match self.slots[index].take() {
            Some(block) => {
                self.buffered -= 1;
                self.current = Some(block);
                self.read_pos = 0;
            }
            None => {
                self.stats.lost += 1;
                self.concealing = self.config.frames_per_block;
                tracing::trace!("Block {} missing, concealing with silence", id);
            }
        }
        true
    }

    fn update_smoothed(&mut self) {
        let alpha = self.config.smoothing;
        self.smoothed_level = alpha * self.level_packets() + (1.0 - alpha) * self.smoothed_level;
    }

    /// Frames available for playback
    pub fn level_frames(&self) -> usize {
        let current = self
            .current
            .as_ref()
            .map(|_| self.config.frames_per_block - self.read_pos)
            .unwrap_or(0);
        current + self.concealing + self.buffered * self.config.frames_per_block
    }

    /// Current level in packets
    pub fn level_packets(&self) -> f64 {
        self.level_frames() as f64 / self.config.frames_per_block as f64
    }

    /// Low-pass filtered level in packets
    pub fn smoothed_level(&self) -> f64 {
        self.smoothed_level
    }

    /// Instantaneous health against min/target/max
    pub fn health(&self) -> BufferHealth {
        BufferHealth::classify(
            self.level_packets(),
            self.config.min_packets as f64,
            self.config.target_packets as f64,
            self.config.max_packets as f64,
            self.config.tolerance_packets,
        )
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn config(&self) -> &JitterConfig {
        &self.config
    }

    /// Discard all buffered audio and forget the playback position
    pub fn reset(&mut self) {
        self.clear_slots();
        self.current = None;
        self.read_pos = 0;
        self.concealing = 0;
        self.next_id = None;
        self.primed = false;
        self.late_run = 0;
        self.smoothed_level = 0.0;
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level_packets: self.level_packets(),
            smoothed_level: self.smoothed_level,
            ..self.stats.clone()
        }
    }
}
