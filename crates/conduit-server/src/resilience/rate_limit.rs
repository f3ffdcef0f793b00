//! Per-connection inbound message rate limiting.

use std::time::Duration;

use conduit_rpc::RateLimitSnapshot;
use tokio::time::Instant;

use super::window::FixedWindow;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Two fixed windows (per second and per minute). A message is admitted
/// only if both have room, and then counts against both.
#[derive(Debug)]
pub struct MessageRateLimiter {
    per_second: u32,
    per_minute: u32,
    second: FixedWindow,
    minute: FixedWindow,
}

impl MessageRateLimiter {
    /// Limiter allowing `per_second` and `per_minute` messages.
    pub fn new(per_second: u32, per_minute: u32) -> Self {
        let now = Instant::now();
        Self {
            per_second,
            per_minute,
            second: FixedWindow::new(now),
            minute: FixedWindow::new(now),
        }
    }

    /// Admit one message. On rejection returns the time until the exhausted
    /// window rolls over.
    pub fn check(&mut self) -> Result<RateLimitSnapshot, Duration> {
        let now = Instant::now();
        self.second.roll(now, SECOND);
        self.minute.roll(now, MINUTE);

        if !self.second.has_room(self.per_second) {
            return Err(self.second.reset_after(now, SECOND));
        }
        if !self.minute.has_room(self.per_minute) {
            return Err(self.minute.reset_after(now, MINUTE));
        }
        self.second.consume();
        self.minute.consume();

        // Report whichever window is tighter.
        let second_left = self.per_second - self.second.count();
        let minute_left = self.per_minute - self.minute.count();
        let snapshot = if second_left <= minute_left {
            RateLimitSnapshot {
                limit: self.per_second,
                remaining: second_left,
                reset_after_ms: millis(self.second.reset_after(now, SECOND)),
            }
        } else {
            RateLimitSnapshot {
                limit: self.per_minute,
                remaining: minute_left,
                reset_after_ms: millis(self.minute.reset_after(now, MINUTE)),
            }
        };
        Ok(snapshot)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
