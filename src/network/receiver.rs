//! Network receive path
//!
//! One task per session reads datagrams, validates them against the
//! negotiated layout, drops duplicates and hands fresh blocks to the audio
//! path through the [`BlockQueue`](crate::audio::buffer::BlockQueue).
//! Control datagrams on the same socket are answered or forwarded here.
//! Nothing on this path ever returns an error to the caller; every rejected
//! datagram is counted instead.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dedup::{DedupOutcome, DedupWindow};
use super::udp::UdpSocket;
use crate::audio::buffer::{AudioBlock, SharedBlockQueue};
use crate::dsp::delay::SharedDelayControl;
use crate::protocol::{sanitize_samples, AudioPacket, ControlPacket, PacketLayout};
use crate::sync::probe::SharedOutputLatency;

/// Probe replies held for a prober that has not collected them yet
pub const CONTROL_REPLY_CAPACITY: usize = 64;

/// Control replies forwarded to whoever is probing
pub type ControlReplies = mpsc::Receiver<(SocketAddr, ControlPacket)>;

/// Receiver counters
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub blocks_delivered: AtomicU64,
    pub duplicates: AtomicU64,
    pub stale: AtomicU64,
    pub invalid_packets: AtomicU64,
    pub sanitized_samples: AtomicU64,
    pub queue_overflows: AtomicU64,
    pub control_packets: AtomicU64,
    /// Probe replies nobody collected before the reply queue filled
    pub dropped_replies: AtomicU64,
    pub dedup_resyncs: AtomicU64,
}

impl ReceiverStats {
    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            blocks_delivered: self.blocks_delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            sanitized_samples: self.sanitized_samples.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            control_packets: self.control_packets.load(Ordering::Relaxed),
            dropped_replies: self.dropped_replies.load(Ordering::Relaxed),
            dedup_resyncs: self.dedup_resyncs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReceiverStatsSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub blocks_delivered: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub invalid_packets: u64,
    pub sanitized_samples: u64,
    pub queue_overflows: u64,
    pub control_packets: u64,
    pub dropped_replies: u64,
    pub dedup_resyncs: u64,
}

/// Audio receiver for one session
pub struct AudioReceiver {
    socket: Arc<UdpSocket>,
    layout: PacketLayout,
    dedup: DedupWindow,
    queue: SharedBlockQueue,
    delay: SharedDelayControl,
    /// Reported in probe replies
    output_latency: SharedOutputLatency,
    replies: mpsc::Sender<(SocketAddr, ControlPacket)>,
    stats: Arc<ReceiverStats>,
}

impl AudioReceiver {
    pub fn new(
        socket: Arc<UdpSocket>,
        layout: PacketLayout,
        dedup_window: usize,
        queue: SharedBlockQueue,
        delay: SharedDelayControl,
        output_latency: SharedOutputLatency,
    ) -> (Self, ControlReplies) {
        let (replies, replies_rx) = mpsc::channel(CONTROL_REPLY_CAPACITY);
        let receiver = Self {
            socket,
            layout,
            dedup: DedupWindow::new(dedup_window),
            queue,
            delay,
            output_latency,
            replies,
            stats: Arc::new(ReceiverStats::default()),
        };
        (receiver, replies_rx)
    }

    /// Get receiver statistics
    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    /// Run the receive loop on its own task until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        // Room for anything the path can carry, so oversized datagrams are
        // seen whole and rejected on length
        let mut buf = vec![0u8; 65536];

        tracing::info!(
            "Receive task started ({} byte packets)",
            self.layout.packet_size()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        if let Some(reply) = self.handle_datagram(&buf[..len], from) {
                            if let Err(e) = self.socket.send_to(&reply.encode(), from).await {
                                tracing::debug!("Probe reply to {} failed: {}", from, e);
                            }
                        }
                    }
                    // ICMP errors from earlier sends surface here on some
                    // platforms; none of them stop the stream
                    Err(e) => tracing::debug!("UDP receive error: {}", e),
                },
            }
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            "Receive task stopped: {} packets, {} blocks delivered, {} duplicates, {} invalid",
            stats.packets_received,
            stats.blocks_delivered,
            stats.duplicates,
            stats.invalid_packets
        );
    }

    /// Process one datagram. Returns a control reply to send back, if any.
    pub fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> Option<ControlPacket> {
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        if ControlPacket::matches(data) {
            return self.handle_control(data, from);
        }

        let mut packet = match AudioPacket::decode(data, &self.layout) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dropping datagram from {}: {}", from, e);
                return None;
            }
        };

        match self.dedup.check(packet.id) {
            DedupOutcome::Fresh => {}
            DedupOutcome::Duplicate => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            DedupOutcome::Stale => {
                self.stats.stale.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        self.stats
            .dedup_resyncs
            .store(self.dedup.resyncs(), Ordering::Relaxed);

        let replaced = sanitize_samples(&mut packet.samples);
        if replaced > 0 {
            self.stats
                .sanitized_samples
                .fetch_add(replaced as u64, Ordering::Relaxed);
        }

        let block = AudioBlock::from_packet(packet, self.layout.channels);
        if self.queue.push(block) {
            self.stats.blocks_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.queue_overflows.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    fn handle_control(&mut self, data: &[u8], from: SocketAddr) -> Option<ControlPacket> {
        let packet = match ControlPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dropping control datagram from {}: {}", from, e);
                return None;
            }
        };
        self.stats.control_packets.fetch_add(1, Ordering::Relaxed);

        match packet {
            ControlPacket::ProbeRequest { .. } => {
                packet.reply_to(self.output_latency.total_ms() as f32)
            }
            ControlPacket::ProbeReply { .. } => {
                // Nobody probing is fine, but unread replies must not pile up
                if self.replies.try_send((from, packet)).is_err() {
                    self.stats.dropped_replies.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
            ControlPacket::AssignDelay { delay_ms, gain } => {
                tracing::info!(
                    "Output delay {:.2} ms, gain {:.2} assigned by {}",
                    delay_ms,
                    gain,
                    from
                );
                self.delay.set(delay_ms, gain as f64);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_queue;
    use crate::config::NetworkConfig;
    use crate::dsp::delay::DelayControl;
    use crate::network::sender::AudioSender;
    use crate::network::udp::create_socket;
    use crate::sync::probe::OutputLatency;
    use std::time::Duration;

    fn loopback_socket() -> Arc<UdpSocket> {
        let config = NetworkConfig::default();
        Arc::new(create_socket("127.0.0.1:0".parse().unwrap(), &config).unwrap())
    }

    fn receiver(queue: SharedBlockQueue) -> (AudioReceiver, ControlReplies) {
        AudioReceiver::new(
            loopback_socket(),
            PacketLayout::new(2, 2),
            48,
            queue,
            Arc::new(DelayControl::new()),
            Arc::new(OutputLatency::new(4.0, 0.0)),
        )
    }

    fn from() -> SocketAddr {
        "10.0.0.2:55555".parse().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_delivered_once() {
        let queue = create_shared_queue(16);
        let (mut rx, _replies) = receiver(queue.clone());
        let bytes = AudioPacket::new(5, 1.0, vec![0.1, 0.2, 0.3, 0.4]).encode();

        rx.handle_datagram(&bytes, from());
        rx.handle_datagram(&bytes, from());

        assert_eq!(queue.len(), 1);
        let stats = rx.stats().snapshot();
        assert_eq!(stats.blocks_delivered, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_malformed_dropped_and_counted() {
        let queue = create_shared_queue(16);
        let (mut rx, _replies) = receiver(queue.clone());

        rx.handle_datagram(&[0u8; 20], from());
        rx.handle_datagram(&[0u8; 100], from());

        assert!(queue.is_empty());
        assert_eq!(rx.stats().snapshot().invalid_packets, 2);
    }

    #[tokio::test]
    async fn test_non_finite_samples_zeroed() {
        let queue = create_shared_queue(16);
        let (mut rx, _replies) = receiver(queue.clone());
        let bytes = AudioPacket::new(0, 1.0, vec![0.5, f32::NAN, f32::NEG_INFINITY, 0.25]).encode();

        rx.handle_datagram(&bytes, from());

        let block = queue.pop().unwrap();
        assert_eq!(block.samples, vec![0.5, 0.0, 0.0, 0.25]);
        assert_eq!(rx.stats().snapshot().sanitized_samples, 2);
    }

    #[tokio::test]
    async fn test_control_handling() {
        let queue = create_shared_queue(16);
        let delay = Arc::new(DelayControl::new());
        let latency = Arc::new(OutputLatency::new(4.0, 0.0));
        let (mut rx, mut replies) = AudioReceiver::new(
            loopback_socket(),
            PacketLayout::new(2, 2),
            48,
            queue,
            delay.clone(),
            latency.clone(),
        );

        let request = ControlPacket::ProbeRequest {
            nonce: 9,
            sent_at: 2.0,
        };
        assert_eq!(
            rx.handle_datagram(&request.encode(), from()),
            request.reply_to(4.0)
        );

        // Device latency measured by playback is reported from then on
        latency.set_device_ms(6.5);
        assert_eq!(
            rx.handle_datagram(&request.encode(), from()),
            request.reply_to(10.5)
        );

        let reply = request.reply_to(1.5).unwrap();
        assert_eq!(rx.handle_datagram(&reply.encode(), from()), None);
        assert_eq!(replies.try_recv().unwrap(), (from(), reply));

        let assign = ControlPacket::AssignDelay {
            delay_ms: 3.0,
            gain: 0.5,
        };
        rx.handle_datagram(&assign.encode(), from());
        assert_eq!(delay.delay_ms(), 3.0);
        assert_eq!(delay.gain(), 0.5);
    }

    #[tokio::test]
    async fn test_one_lost_copy_still_delivers_block_unmodified() {
        let queue = create_shared_queue(16);
        let (rx, _replies) = receiver(queue.clone());
        let rx_addr = rx.socket.local_addr().unwrap();
        let stats = rx.stats();
        let cancel = CancellationToken::new();
        let handle = rx.spawn(cancel.clone());

        // Block 0 arrives twice, block 1 loses its first copy, block 2 its second
        let raw = loopback_socket();
        let blocks: Vec<AudioPacket> = (0..3)
            .map(|id| AudioPacket::new(id, id as f64, vec![id as f32, 0.5, -0.5, 0.25]))
            .collect();
        for copies in [(&blocks[0], 2), (&blocks[1], 1), (&blocks[2], 1)] {
            for _ in 0..copies.1 {
                raw.send_to(&copies.0.encode(), rx_addr).await.unwrap();
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while stats.snapshot().packets_received < 4 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let delivered: Vec<AudioBlock> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(delivered.len(), 3);
        for (block, packet) in delivered.iter().zip(&blocks) {
            assert_eq!(block.id, packet.id);
            assert_eq!(block.samples, packet.samples);
        }
    }

    #[tokio::test]
    async fn test_sender_to_receiver_over_loopback() {
        let queue = create_shared_queue(16);
        let (rx, _replies) = receiver(queue.clone());
        let rx_addr = rx.socket.local_addr().unwrap();
        let stats = rx.stats();
        let cancel = CancellationToken::new();
        let handle = rx.spawn(cancel.clone());

        let sender = AudioSender::new(loopback_socket(), PacketLayout::new(2, 2), vec![rx_addr], 1.0);
        for i in 0..4 {
            sender.send_block(&[i as f32; 4]).await.unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while stats.snapshot().packets_received < 8 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.blocks_delivered, 4);
        assert_eq!(snapshot.duplicates, 4);
        assert_eq!(queue.len(), 4);
    }

    #[tokio::test]
    async fn test_uncollected_replies_are_bounded() {
        let queue = create_shared_queue(16);
        let (mut rx, mut replies) = receiver(queue);
        let reply = ControlPacket::ProbeRequest {
            nonce: 1,
            sent_at: 0.0,
        }
        .reply_to(0.0)
        .unwrap();

        for _ in 0..CONTROL_REPLY_CAPACITY + 10 {
            rx.handle_datagram(&reply.encode(), from());
        }

        assert_eq!(rx.stats().snapshot().dropped_replies, 10);
        let mut queued = 0;
        while replies.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, CONTROL_REPLY_CAPACITY);
    }
}
