use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::audio::AudioFrame;

/// Bounded outbound audio queue with oldest-drop overflow
///
/// Producers never wait: when the queue is full the oldest frames are
/// evicted so the newest audio always goes out, in capture order.
pub struct AudioQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    notify: Notify,
}

impl AudioQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    fn frames(&self) -> MutexGuard<'_, VecDeque<AudioFrame>> {
        self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a frame; returns how many old frames were dropped to make room
    pub fn push(&self, frame: AudioFrame) -> usize {
        let dropped = {
            let mut frames = self.frames();
            frames.push_back(frame);
            let excess = frames.len().saturating_sub(self.capacity);
            frames.drain(..excess);
            excess
        };
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.frames().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) -> usize {
        let mut frames = self.frames();
        let count = frames.len();
        frames.clear();
        count
    }

    /// Wait until a frame has been pushed since the last wakeup
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
