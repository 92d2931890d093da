use std::collections::VecDeque;

use super::frame::Frame;

/// Default number of frames held while no exporter is ready.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 200;

/// Bounded FIFO of frames waiting for a ready exporter.
/// On overflow the oldest frame is dropped.
#[derive(Debug)]
pub struct FrameOutbox {
    frames: VecDeque<Frame>,
    capacity: usize,
    dropped: u64,
}

impl FrameOutbox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Queues a frame, returning the evicted oldest frame on overflow.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = if self.frames.len() >= self.capacity {
            self.dropped += 1;
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        evicted
    }

    /// Puts a frame back at the front after a failed export.
    /// Does nothing if the outbox is already full of newer frames.
    pub fn requeue_front(&mut self, frame: Frame) {
        if self.frames.len() >= self.capacity {
            self.dropped += 1;
            return;
        }
        self.frames.push_front(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for FrameOutbox {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}
