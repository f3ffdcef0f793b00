//! Per-client request quota over fixed windows.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::window::FixedWindow;

/// Outcome of a quota check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The request was counted.
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
        /// Time until the window resets.
        reset_after: Duration,
    },
    /// The window is exhausted.
    Rejected {
        /// Time until the window resets.
        retry_after: Duration,
    },
}

impl QuotaDecision {
    /// Whole seconds to advertise in `Retry-After` (at least 1).
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Allowed { .. } => None,
            Self::Rejected { retry_after } => Some(ceil_secs(*retry_after).max(1)),
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Fixed-window request counter keyed by client.
#[derive(Debug)]
pub struct QuotaTracker {
    limit: u32,
    window: Duration,
    records: Mutex<HashMap<String, FixedWindow>>,
}

impl QuotaTracker {
    /// `limit` requests per `window` for each key.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request against `key`, or reject it.
    pub fn check(&self, key: &str) -> QuotaDecision {
        let now = Instant::now();
        let mut records = self.records.lock();
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| FixedWindow::new(now));
        record.roll(now, self.window);

        if !record.has_room(self.limit) {
            return QuotaDecision::Rejected {
                retry_after: record.reset_after(now, self.window),
            };
        }
        record.consume();
        QuotaDecision::Allowed {
            remaining: self.limit - record.count(),
            reset_after: record.reset_after(now, self.window),
        }
    }

    /// Drop records whose window has elapsed. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, w| !w.is_expired(now, self.window));
        before - records.len()
    }

    /// Tracked keys.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}
