//! Lock-free hand-off between the network and audio paths
//!
//! The network receive task is the only producer and the audio callback the
//! only consumer. Neither side ever blocks: a full queue drops the incoming
//! block and an empty queue simply yields nothing.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::protocol::AudioPacket;

/// Decoded block of interleaved PCM
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBlock {
    /// Sender-assigned block id
    pub id: u64,
    /// Sender wall clock at capture, in seconds
    pub timestamp: f64,
    /// Interleaved f32 samples
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
}

impl AudioBlock {
    pub fn new(id: u64, timestamp: f64, samples: Vec<f32>, channels: u16) -> Self {
        Self {
            id,
            timestamp,
            samples,
            channels,
        }
    }

    pub fn from_packet(packet: AudioPacket, channels: u16) -> Self {
        Self::new(packet.id, packet.timestamp, packet.samples, channels)
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Bounded SPSC queue of blocks
pub struct BlockQueue {
    queue: ArrayQueue<AudioBlock>,
    closed: AtomicBool,
    overflow_count: AtomicUsize,
}

impl BlockQueue {
    /// Create a new queue with the specified capacity in blocks
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a block. A full queue keeps what it holds and rejects this
    /// block. Returns false if the queue is full or closed.
    pub fn push(&self, block: AudioBlock) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.queue.push(block) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest block, if any
    pub fn pop(&self) -> Option<AudioBlock> {
        self.queue.pop()
    }

    /// Mark the queue torn down and discard its contents
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drain();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Discard everything queued. Returns the number of blocks dropped.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Blocks rejected because the consumer fell behind
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a block queue
pub type SharedBlockQueue = Arc<BlockQueue>;

/// Create a new shared block queue
pub fn create_shared_queue(capacity: usize) -> SharedBlockQueue {
    Arc::new(BlockQueue::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo() {
        let queue = BlockQueue::new(4);

        assert!(queue.push(AudioBlock::new(0, 0.0, vec![0.0; 256], 2)));
        assert!(queue.push(AudioBlock::new(1, 0.1, vec![1.0; 256], 2)));
        assert_eq!(queue.len(), 2);

        let popped = queue.pop().unwrap();
        assert_eq!(popped.id, 0);
        assert_eq!(popped.frames(), 128);
        assert_eq!(queue.pop().unwrap().id, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_overflow_rejects_newest() {
        let queue = BlockQueue::new(1);
        assert!(queue.push(AudioBlock::new(0, 0.0, vec![], 1)));
        assert!(!queue.push(AudioBlock::new(1, 0.0, vec![], 1)));
        assert_eq!(queue.overflow_count(), 1);

        // The queued block survives; the rejected one is gone
        assert_eq!(queue.pop().unwrap().id, 0);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_closed_queue_rejects_and_drains() {
        let queue = create_shared_queue(4);
        queue.push(AudioBlock::new(0, 0.0, vec![], 1));
        queue.close();

        assert!(queue.is_empty());
        assert!(!queue.push(AudioBlock::new(1, 0.0, vec![], 1)));
    }

    #[test]
    fn test_cross_thread_handoff() {
        let queue = create_shared_queue(64);
        let producer = queue.clone();

        let handle = std::thread::spawn(move || {
            for id in 0..32u64 {
                while !producer.push(AudioBlock::new(id, 0.0, vec![id as f32], 1)) {
                    std::thread::yield_now();
                }
            }
        });

        let mut next = 0u64;
        while next < 32 {
            if let Some(block) = queue.pop() {
                assert_eq!(block.id, next);
                next += 1;
            }
        }
        handle.join().unwrap();
    }
}
