//! `/health` and `/metrics` bodies for the HTTP transport.

use serde::Serialize;
use std::time::Instant;

use crate::resilience::{BreakerSnapshot, BreakerState};

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Breaker closed.
    Ok,
    /// Breaker open or probing.
    Degraded,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok` unless the circuit breaker is open or half-open.
    pub status: HealthStatus,
    /// Requests holding an admission slot.
    pub active_requests: usize,
    /// Requests waiting for a slot.
    pub queued_requests: usize,
    /// Breaker state and counters.
    pub circuit_breaker: BreakerSnapshot,
    /// Seconds since the transport was built.
    pub uptime_secs: u64,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    active_requests: usize,
    queued_requests: usize,
    circuit_breaker: BreakerSnapshot,
) -> HealthResponse {
    let status = if circuit_breaker.state == BreakerState::Closed {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    };
    HealthResponse {
        status,
        active_requests,
        queued_requests,
        circuit_breaker,
        uptime_secs: start_time.elapsed().as_secs(),
    }
}

/// Requests refused before dispatch, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RejectedTotals {
    /// Credential gate.
    pub auth: u64,
    /// Per-client quota.
    pub quota: u64,
    /// Open circuit breaker.
    pub circuit: u64,
    /// Admission queue full.
    pub overload: u64,
}

/// `/metrics` body: the health counters plus running totals.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsResponse {
    /// Same fields as `/health`.
    #[serde(flatten)]
    pub health: HealthResponse,
    /// Requests received on `/mcp`.
    pub requests_total: u64,
    /// Requests refused before dispatch.
    pub rejected_total: RejectedTotals,
    /// Requests that hit the reply deadline.
    pub timeouts_total: u64,
}
