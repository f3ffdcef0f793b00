//! Fixed-window counter shared by the quota tracker and the rate limiter.

use std::time::Duration;

use tokio::time::Instant;

/// Counter that resets when its window elapses.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedWindow {
    started_at: Instant,
    count: u32,
}

impl FixedWindow {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            count: 0,
        }
    }

    /// Start a fresh window if the current one has elapsed.
    pub(crate) fn roll(&mut self, now: Instant, length: Duration) {
        if now.duration_since(self.started_at) >= length {
            self.started_at = now;
            self.count = 0;
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn has_room(&self, limit: u32) -> bool {
        self.count < limit
    }

    pub(crate) fn consume(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// Time until the window rolls over.
    pub(crate) fn reset_after(&self, now: Instant, length: Duration) -> Duration {
        (self.started_at + length).saturating_duration_since(now)
    }

    pub(crate) fn is_expired(&self, now: Instant, length: Duration) -> bool {
        now.duration_since(self.started_at) >= length
    }
}
