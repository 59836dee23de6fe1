//! Wire formats
//!
//! Audio datagram (little-endian):
//!
//! ```text
//! [0..8)   packet id   u64
//! [8..16)  timestamp   f64, sender wall clock in seconds
//! [16..)   PCM         interleaved f32, frames_per_block * channels samples
//! ```
//!
//! Control datagram:
//!
//! ```text
//! [0..4)   magic "LSPR"
//! [4]      kind (0 = probe request, 1 = probe reply, 2 = delay assignment)
//! [5..13)  nonce   u64
//! [13..21) value   f64 (request timestamp in seconds, or delay in ms)
//! [21..25) extra   f32 (output latency in ms, or gain)
//! ```
//!
//! Audio datagrams are always `16 + 4k` bytes, so the 25 byte control
//! datagram can never be mistaken for one.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::config::SessionConfig;
use crate::constants::{BYTES_PER_SAMPLE, PACKET_HEADER_SIZE};

/// Why a datagram was rejected. Counted by the receiver, never surfaced.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("datagram length {actual} does not match negotiated {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("bad control magic")]
    BadMagic,

    #[error("unknown control kind {0}")]
    UnknownKind(u8),
}

/// Fixed packet geometry negotiated at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub frames_per_block: usize,
    pub channels: u16,
}

impl PacketLayout {
    pub fn new(frames_per_block: usize, channels: u16) -> Self {
        Self {
            frames_per_block,
            channels,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.frames_per_block, config.channel_count)
    }

    /// Interleaved samples per packet
    pub fn samples(&self) -> usize {
        self.frames_per_block * self.channels as usize
    }

    /// Total datagram size
    pub fn packet_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.samples() * BYTES_PER_SAMPLE
    }
}

/// One block of audio as carried on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    /// Monotonic, sender-assigned block id
    pub id: u64,
    /// Sender wall clock at capture, in seconds
    pub timestamp: f64,
    /// Interleaved PCM
    pub samples: Vec<f32>,
}

impl AudioPacket {
    pub fn new(id: u64, timestamp: f64, samples: Vec<f32>) -> Self {
        Self {
            id,
            timestamp,
            samples,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.samples.len() * BYTES_PER_SAMPLE
    }

    /// Serialize into `buf` (cleared first)
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.clear();
        buf.reserve(self.encoded_len());
        buf.put_u64_le(self.id);
        buf.put_f64_le(self.timestamp);
        for sample in &self.samples {
            buf.put_f32_le(*sample);
        }
    }

    /// Serialize into a fresh buffer
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Parse a datagram, requiring exactly the negotiated layout
    pub fn decode(data: &[u8], layout: &PacketLayout) -> Result<Self, PacketError> {
        let expected = layout.packet_size();
        if data.len() < expected {
            return Err(PacketError::TooShort(data.len()));
        }
        if data.len() != expected {
            return Err(PacketError::WrongLength {
                expected,
                actual: data.len(),
            });
        }

        let mut cursor = data;
        let id = cursor.get_u64_le();
        let timestamp = cursor.get_f64_le();
        let mut samples = Vec::with_capacity(layout.samples());
        while cursor.has_remaining() {
            samples.push(cursor.get_f32_le());
        }

        Ok(Self {
            id,
            timestamp,
            samples,
        })
    }
}

/// Replace NaN/Inf samples with silence. Returns how many were replaced.
pub fn sanitize_samples(samples: &mut [f32]) -> usize {
    let mut replaced = 0;
    for sample in samples.iter_mut() {
        if !sample.is_finite() {
            *sample = 0.0;
            replaced += 1;
        }
    }
    replaced
}

/// Sender wall clock in seconds, as stamped into each packet
pub fn capture_timestamp() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}

/// Out-of-band control datagram: latency probes and delay assignments
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlPacket {
    /// Echo request; `sent_at` is the requester's clock, returned unchanged
    ProbeRequest { nonce: u64, sent_at: f64 },
    /// Echo reply carrying the responder's audio output latency
    ProbeReply {
        nonce: u64,
        sent_at: f64,
        output_latency_ms: f32,
    },
    /// Output delay and gain a receiver should apply
    AssignDelay { delay_ms: f64, gain: f32 },
}

impl ControlPacket {
    pub const MAGIC: [u8; 4] = *b"LSPR";
    pub const SIZE: usize = 25;

    /// Reply to a probe request; `None` for any other packet
    pub fn reply_to(&self, output_latency_ms: f32) -> Option<Self> {
        match *self {
            ControlPacket::ProbeRequest { nonce, sent_at } => Some(ControlPacket::ProbeReply {
                nonce,
                sent_at,
                output_latency_ms,
            }),
            _ => None,
        }
    }

    /// Quick check before a full decode
    pub fn matches(data: &[u8]) -> bool {
        data.len() == Self::SIZE && data[..4] == Self::MAGIC
    }

    pub fn encode(&self) -> BytesMut {
        let (kind, nonce, value, extra) = match *self {
            ControlPacket::ProbeRequest { nonce, sent_at } => (0u8, nonce, sent_at, 0.0),
            ControlPacket::ProbeReply {
                nonce,
                sent_at,
                output_latency_ms,
            } => (1, nonce, sent_at, output_latency_ms),
            ControlPacket::AssignDelay { delay_ms, gain } => (2, 0, delay_ms, gain),
        };

        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&Self::MAGIC);
        buf.put_u8(kind);
        buf.put_u64_le(nonce);
        buf.put_f64_le(value);
        buf.put_f32_le(extra);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::SIZE {
            return Err(PacketError::TooShort(data.len()));
        }
        if data[..4] != Self::MAGIC {
            return Err(PacketError::BadMagic);
        }

        let mut cursor = &data[4..Self::SIZE];
        let kind = cursor.get_u8();
        let nonce = cursor.get_u64_le();
        let value = cursor.get_f64_le();
        let extra = cursor.get_f32_le();

        match kind {
            0 => Ok(ControlPacket::ProbeRequest {
                nonce,
                sent_at: value,
            }),
            1 => Ok(ControlPacket::ProbeReply {
                nonce,
                sent_at: value,
                output_latency_ms: extra,
            }),
            2 => Ok(ControlPacket::AssignDelay {
                delay_ms: value,
                gain: extra,
            }),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let packet = AudioPacket::new(0x0102030405060708, 1.5, vec![0.25, -1.0]);
        let bytes = packet.encode();

        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..8], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &1.5f64.to_le_bytes());
        assert_eq!(&bytes[16..20], &0.25f32.to_le_bytes());
        assert_eq!(&bytes[20..24], &(-1.0f32).to_le_bytes());

        let layout = PacketLayout::new(1, 2);
        assert_eq!(AudioPacket::decode(&bytes, &layout).unwrap(), packet);
    }

    #[test]
    fn test_default_layout_size() {
        let layout = PacketLayout::new(128, 2);
        assert_eq!(layout.packet_size(), 1040);
    }

    #[test]
    fn test_malformed_lengths() {
        let layout = PacketLayout::new(4, 2);
        assert_eq!(
            AudioPacket::decode(&[0u8; 10], &layout),
            Err(PacketError::TooShort(10))
        );
        assert_eq!(
            AudioPacket::decode(&[0u8; 60], &layout),
            Err(PacketError::WrongLength {
                expected: 48,
                actual: 60
            })
        );
    }

    #[test]
    fn test_sanitize() {
        let mut samples = vec![0.5, f32::NAN, f32::INFINITY, -0.5];
        assert_eq!(sanitize_samples(&mut samples), 2);
        assert_eq!(samples, vec![0.5, 0.0, 0.0, -0.5]);
    }

    #[test]
    fn test_probe_reply_keeps_nonce() {
        let request = ControlPacket::ProbeRequest {
            nonce: 42,
            sent_at: 1000.25,
        };
        let bytes = request.encode();
        assert!(ControlPacket::matches(&bytes));
        assert_eq!(ControlPacket::decode(&bytes).unwrap(), request);

        let reply = request.reply_to(3.5).unwrap();
        assert_eq!(
            ControlPacket::decode(&reply.encode()).unwrap(),
            ControlPacket::ProbeReply {
                nonce: 42,
                sent_at: 1000.25,
                output_latency_ms: 3.5
            }
        );
        assert!(reply.reply_to(1.0).is_none());
    }

    #[test]
    fn test_delay_assignment() {
        let assign = ControlPacket::AssignDelay {
            delay_ms: 3.0,
            gain: 0.9,
        };
        let bytes = assign.encode();
        assert_eq!(bytes.len(), ControlPacket::SIZE);
        assert_eq!(ControlPacket::decode(&bytes).unwrap(), assign);

        let mut bad = bytes.clone();
        bad[4] = 9;
        assert_eq!(ControlPacket::decode(&bad), Err(PacketError::UnknownKind(9)));
    }

    #[test]
    fn test_control_never_matches_audio() {
        // Audio datagrams are 16 + 4k bytes
        for frames in 1..64 {
            let layout = PacketLayout::new(frames, 1);
            assert_ne!(layout.packet_size(), ControlPacket::SIZE);
        }
        let mut bytes = ControlPacket::ProbeRequest {
            nonce: 1,
            sent_at: 0.0,
        }
        .encode();
        bytes[0] = b'X';
        assert!(!ControlPacket::matches(&bytes));
        assert_eq!(ControlPacket::decode(&bytes), Err(PacketError::BadMagic));
    }
}
