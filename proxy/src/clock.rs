//! Cached clock.
//!
//! Every age comparison reads the cached instant instead of the live clock.
//! The worker refreshes it on a fixed interval, so timeout math is only as
//! precise as that interval.

use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ClockCache {
    now: Instant,
}

impl ClockCache {
    pub fn new() -> Self {
        Self { now: Instant::now() }
    }

    /// The instant recorded by the most recent tick.
    #[inline]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Refresh the cached instant from the live clock.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Overwrite the cached instant.
    pub fn tick_at(&mut self, now: Instant) {
        self.now = now;
    }
}

impl Default for ClockCache {
    fn default() -> Self {
        Self::new()
    }
}
