//! Single-slot latest-frame handoff between a capture task and its readers.
//!
//! The slot holds an `Arc<Frame>`. Publishing swaps the pointer and peeking
//! clones it, so the lock is held for a pointer copy and never across decode
//! work. Older frames are dropped, never queued: a slow reader only ever
//! misses frames, it cannot make the producer wait.

use crate::frame::Frame;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: RwLock<Option<Arc<Frame>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame unconditionally.
    pub fn publish(&self, frame: Arc<Frame>) {
        let previous = self.slot.write().replace(frame);
        // Drop the old frame outside the lock
        drop(previous);
    }

    /// Current frame, left in place for other readers.
    pub fn peek(&self) -> Option<Arc<Frame>> {
        self.slot.read().clone()
    }

    pub fn clear(&self) {
        let previous = self.slot.write().take();
        drop(previous);
    }

    pub fn is_empty(&self) -> bool {
        self.slot.read().is_none()
    }
}
