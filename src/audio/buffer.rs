//! Lock-free ring buffer for captured audio frames
//!
//! Single-producer single-consumer handoff between the capture thread and
//! the async send pump, sized to keep worst-case latency bounded.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One capture cycle's worth of 16-bit little-endian mono PCM, ready for
/// transmission. Immutable once built; consumed exactly once by the send path.
#[derive(Clone)]
pub struct AudioFrame {
    /// PCM bytes, already volume-adjusted (or zeroed when muted).
    data: Bytes,
    /// Capture timestamp in microseconds since pipeline start.
    timestamp: u64,
}

impl AudioFrame {
    pub fn new(data: Bytes, timestamp: u64) -> Self {
        Self { data, timestamp }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn into_payload(self) -> Bytes {
        self.data
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Number of 16-bit samples in the frame.
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }
}

/// Lock-free ring buffer for audio frames
pub struct RingBuffer {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame into the buffer.
    /// Returns false if the buffer is full (overflow); the frame is dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop a frame from the buffer.
    /// Returns None if the buffer is empty (underrun).
    pub fn pop(&self) -> Option<AudioFrame> {
        match self.queue.pop() {
            Some(frame) => Some(frame),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Try to pop without counting underrun
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
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

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Drop any queued frames, e.g. when a session ends mid-stream.
    pub fn drain(&self) {
        while self.queue.pop().is_some() {}
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}
