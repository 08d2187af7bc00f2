//! Per-block visibility watermark.
//!
//! The watermark is the only state shared between a block's writer and its
//! readers. The writer publishes a new length after every acknowledged
//! flush; readers take a single atomic load. A reader therefore sees either
//! the old or the new length, never anything in between.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Visible length of one block
#[derive(Debug, Default)]
pub struct VisibleLength {
    length: AtomicU64,
    sealed: AtomicBool,
}

impl VisibleLength {
    /// Create a watermark at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current visible length
    #[inline]
    pub fn get(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// Publish `length`, returning the watermark after the update.
    ///
    /// The watermark never moves backwards; publishing a smaller value is a
    /// no-op.
    pub fn publish(&self, length: u64) -> u64 {
        let previous = self.length.fetch_max(length, Ordering::AcqRel);
        previous.max(length)
    }

    /// Publish the final length and mark the block sealed.
    pub fn seal(&self, length: u64) -> u64 {
        let visible = self.publish(length);
        self.sealed.store(true, Ordering::Release);
        visible
    }

    /// Whether the block's length is final
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}
