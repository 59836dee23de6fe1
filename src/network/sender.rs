//! Redundant audio transmission
//!
//! Each block goes out twice to every peer. The first copy is sent inline,
//! the second from a spawned task after the redundancy delay so a single
//! lost datagram is covered by its twin.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::udp::UdpSocket;
use crate::error::NetworkError;
use crate::protocol::{capture_timestamp, AudioPacket, ControlPacket, PacketLayout};

/// Sender counters
#[derive(Debug, Default)]
pub struct SenderStats {
    pub blocks_sent: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

impl SenderStats {
    fn record(&self, result: &std::io::Result<usize>, peer: SocketAddr) {
        match result {
            Ok(len) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(*len as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Send to {} failed: {}", peer, e);
            }
        }
    }

    pub fn snapshot(&self) -> SenderStatsSnapshot {
        SenderStatsSnapshot {
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SenderStatsSnapshot {
    pub blocks_sent: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Audio sender for one session
pub struct AudioSender {
    socket: Arc<UdpSocket>,
    layout: PacketLayout,
    peers: RwLock<Vec<SocketAddr>>,
    redundancy_delay: Duration,
    next_id: AtomicU64,
    stats: Arc<SenderStats>,
}

impl AudioSender {
    pub fn new(
        socket: Arc<UdpSocket>,
        layout: PacketLayout,
        peers: Vec<SocketAddr>,
        redundancy_delay_ms: f64,
    ) -> Self {
        Self {
            socket,
            layout,
            peers: RwLock::new(peers),
            redundancy_delay: Duration::from_secs_f64(redundancy_delay_ms.max(0.0) / 1000.0),
            next_id: AtomicU64::new(0),
            stats: Arc::new(SenderStats::default()),
        }
    }

    /// Current peer list
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().clone()
    }

    pub fn add_peer(&self, peer: SocketAddr) {
        let mut peers = self.peers.write();
        if !peers.contains(&peer) {
            tracing::info!("Added peer {}", peer);
            peers.push(peer);
        }
    }

    pub fn remove_peer(&self, peer: SocketAddr) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| *p != peer);
        peers.len() != before
    }

    /// Id the next block will carry
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Get sender statistics
    pub fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    /// Send one block of interleaved PCM to every peer, twice. Returns the
    /// id it was sent under. Per-datagram failures are counted, not returned.
    pub async fn send_block(&self, samples: &[f32]) -> Result<u64, NetworkError> {
        let expected = self.layout.samples();
        if samples.len() != expected {
            return Err(NetworkError::InvalidBlock {
                expected,
                actual: samples.len(),
            });
        }

        let peers = self.peers();
        if peers.is_empty() {
            return Err(NetworkError::NoPeers);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let packet = AudioPacket::new(id, capture_timestamp(), samples.to_vec());
        let bytes: Bytes = packet.encode().freeze();

        for peer in &peers {
            let result = self.socket.send_to(&bytes, *peer).await;
            self.stats.record(&result, *peer);
        }

        let socket = self.socket.clone();
        let stats = self.stats.clone();
        let delay = self.redundancy_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for peer in &peers {
                let result = socket.send_to(&bytes, *peer).await;
                stats.record(&result, *peer);
            }
        });

        self.stats.blocks_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Sent block {}", id);
        Ok(id)
    }

    /// Send a control datagram to one peer
    pub async fn send_control(
        &self,
        peer: SocketAddr,
        packet: &ControlPacket,
    ) -> Result<(), NetworkError> {
        self.socket
            .send_to(&packet.encode(), peer)
            .await
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed(format!("{}: {}", peer, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::network::udp::create_socket;

    async fn loopback_socket() -> UdpSocket {
        let config = NetworkConfig::default();
        create_socket("127.0.0.1:0".parse().unwrap(), &config).unwrap()
    }

    #[tokio::test]
    async fn test_sends_two_identical_copies() {
        let receiver = loopback_socket().await;
        let peer = receiver.local_addr().unwrap();
        let sender = AudioSender::new(
            Arc::new(loopback_socket().await),
            PacketLayout::new(2, 2),
            vec![peer],
            1.0,
        );

        let samples = [0.1, -0.2, 0.3, -0.4];
        let id = sender.send_block(&samples).await.unwrap();
        assert_eq!(id, 0);

        let mut first = [0u8; 64];
        let mut second = [0u8; 64];
        let (n1, _) = receiver.recv_from(&mut first).await.unwrap();
        let (n2, _) = receiver.recv_from(&mut second).await.unwrap();
        assert_eq!(n1, 32);
        assert_eq!(first[..n1], second[..n2]);

        let packet = AudioPacket::decode(&first[..n1], &PacketLayout::new(2, 2)).unwrap();
        assert_eq!(packet.samples, samples.to_vec());
        assert_eq!(sender.next_id(), 1);
        assert_eq!(sender.stats().snapshot().packets_sent, 2);
    }

    #[tokio::test]
    async fn test_rejects_wrong_block_size_and_no_peers() {
        let sender = AudioSender::new(
            Arc::new(loopback_socket().await),
            PacketLayout::new(2, 2),
            Vec::new(),
            1.0,
        );
        assert!(matches!(
            sender.send_block(&[0.0; 3]).await,
            Err(NetworkError::InvalidBlock {
                expected: 4,
                actual: 3
            })
        ));
        assert!(matches!(
            sender.send_block(&[0.0; 4]).await,
            Err(NetworkError::NoPeers)
        ));
    }

    #[tokio::test]
    async fn test_peer_list() {
        let sender = AudioSender::new(
            Arc::new(loopback_socket().await),
            PacketLayout::new(2, 2),
            Vec::new(),
            1.0,
        );
        let peer: SocketAddr = "127.0.0.1:55555".parse().unwrap();
        sender.add_peer(peer);
        sender.add_peer(peer);
        assert_eq!(sender.peers(), vec![peer]);
        assert!(sender.remove_peer(peer));
        assert!(!sender.remove_peer(peer));
    }
}
