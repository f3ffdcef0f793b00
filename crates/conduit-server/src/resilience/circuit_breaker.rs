//! Three-state circuit breaker for the HTTP transport.
//!
//! - `closed`: each failure increments the failure count and each success
//!   decrements it (saturating). Reaching the threshold opens the breaker.
//! - `open`: requests are rejected until the cooldown since the last
//!   failure has elapsed; the next admission check then moves to half-open.
//! - `half-open`: any failure reopens; enough consecutive successes close
//!   the breaker and reset both counters.
//!
//! Only admitted requests are recorded, and protocol-level errors travel
//! inside 200 replies, so in practice the breaker trips on infrastructure
//! failures (a dispatch task dying) and not on handler errors.

use std::time::Duration;

use conduit_settings::CircuitBreakerSettings;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::{HTTP_BREAKER_STATE, HTTP_BREAKER_TRANSITIONS_TOTAL};

/// Breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Requests flow.
    #[serde(rename = "closed")]
    Closed,
    /// Requests are rejected.
    #[serde(rename = "open")]
    Open,
    /// Probing after cooldown.
    #[serde(rename = "half-open")]
    HalfOpen,
}

impl BreakerState {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Point-in-time view for health reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Failures counted while closed.
    pub failure_count: u32,
    /// Consecutive successes while half-open.
    pub success_count: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

/// Circuit breaker guarding request admission.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    half_open_successes: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Breaker tuned by `settings`.
    pub fn new(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: settings.cooldown(),
            half_open_successes: settings.half_open_successes.max(1),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Whether a request may proceed. Moves `open` to `half-open` once the
    /// cooldown has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let cooled = inner
                    .last_failure_at
                    .is_none_or(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    inner.success_count = 0;
                    transition(&mut inner, BreakerState::HalfOpen);
                }
                cooled
            }
        }
    }

    /// Record a completed request that did not fail.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.half_open_successes {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_at = Some(Instant::now());
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        cooldown_ms = self.cooldown.as_millis(),
                        "circuit breaker opened"
                    );
                    transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.last_failure_at = Some(Instant::now());
                inner.success_count = 0;
                warn!("circuit breaker probe failed, reopening");
                transition(&mut inner, BreakerState::Open);
            }
            // Outcomes of requests admitted before the breaker opened.
            BreakerState::Open => {}
        }
    }

    /// Record an HTTP completion; 5xx counts as a failure.
    pub fn record_status(&self, status: u16) {
        if status >= 500 {
            self.record_failure();
        } else {
            self.record_success();
        }
    }

    /// Current state without side effects.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Counters and state.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }
}

fn transition(inner: &mut Inner, to: BreakerState) {
    if inner.state == to {
        return;
    }
    let from = inner.state;
    inner.state = to;
    if to == BreakerState::Closed {
        info!(from = from.as_str(), "circuit breaker closed");
    }
    counter!(HTTP_BREAKER_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
    gauge!(HTTP_BREAKER_STATE).set(to.gauge_value());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerSettings {
            failure_threshold: threshold,
            cooldown_ms,
            half_open_successes: successes,
        })
    }

    #[test]
    fn starts_closed() {
        let b = breaker(3, 1000, 2);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow_request());
    }

    #[test]
    fn opens_at_threshold() {
        let b = breaker(3, 1000, 2);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn success_decrements_failure_count() {
        let b = breaker(3, 1000, 2);
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.snapshot().failure_count, 1);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_success();
        b.record_success();
        b.record_success();
        assert_eq!(b.snapshot().failure_count, 0);
    }

    #[test]
    fn status_classification() {
        let b = breaker(2, 1000, 1);
        b.record_status(404);
        b.record_status(408);
        assert_eq!(b.snapshot().failure_count, 0);
        b.record_status(500);
        b.record_status(503);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown() {
        let b = breaker(1, 1000, 2);
        b.record_failure();
        assert!(!b.allow_request());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!b.allow_request());
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(b.allow_request());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_consecutive_successes() {
        let b = breaker(1, 100, 3);
        b.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(b.allow_request());

        b.record_success();
        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        let snap = b.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_fresh_cooldown() {
        let b = breaker(1, 100, 3);
        b.record_failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(b.allow_request());
        b.record_success();

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(b.allow_request());
        assert_eq!(b.snapshot().success_count, 0);
    }

    #[test]
    fn outcomes_ignored_while_open() {
        let b = breaker(1, 60_000, 1);
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.snapshot().failure_count, 1);
    }

    #[test]
    fn state_serializes_with_hyphen() {
        let json = serde_json::to_string(&BreakerState::HalfOpen).unwrap();
        assert_eq!(json, "\"half-open\"");
        let snap = breaker(3, 1, 1).snapshot();
        let v = serde_json::to_value(snap).unwrap();
        assert_eq!(v["state"], "closed");
        assert_eq!(v["failureCount"], 0);
    }
}
