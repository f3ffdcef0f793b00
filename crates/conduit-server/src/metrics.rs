//! Metric names recorded through the `metrics` facade.
//!
//! No recorder is installed by this crate; embedders pick their exporter.

pub use conduit_rpc::metrics::{
    DISPATCH_DURATION_SECONDS, DISPATCH_ERRORS_TOTAL, DISPATCH_MESSAGES_TOTAL,
    DISPATCH_TIMEOUTS_TOTAL,
};

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused at capacity or by the credential gate (counter, labels: reason).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Inbound frames dropped by the rate limiter or size check (counter, labels: reason).
pub const WS_FRAMES_DROPPED_TOTAL: &str = "ws_frames_dropped_total";
/// Outbound sends refused for backpressure (counter).
pub const WS_BACKPRESSURE_TOTAL: &str = "ws_backpressure_total";

/// HTTP requests received on `/mcp` (counter).
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
/// HTTP requests rejected before dispatch (counter, labels: reason).
pub const HTTP_REJECTED_TOTAL: &str = "http_rejected_total";
/// HTTP requests that hit the reply deadline (counter).
pub const HTTP_TIMEOUTS_TOTAL: &str = "http_timeouts_total";
/// HTTP request latency including queueing (histogram).
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
/// Circuit breaker state (gauge: 0 closed, 1 half-open, 2 open).
pub const HTTP_BREAKER_STATE: &str = "http_breaker_state";
/// Circuit breaker transitions (counter, labels: to).
pub const HTTP_BREAKER_TRANSITIONS_TOTAL: &str = "http_breaker_transitions_total";

/// Streaming sessions opened (counter).
pub const STREAM_SESSIONS_TOTAL: &str = "stream_sessions_total";
/// Active streaming sessions (gauge).
pub const STREAM_SESSIONS_ACTIVE: &str = "stream_sessions_active";
/// Streaming session terminations (counter, labels: reason).
pub const STREAM_TERMINATIONS_TOTAL: &str = "stream_terminations_total";
/// Lines handed to the dispatcher (counter).
pub const STREAM_LINES_TOTAL: &str = "stream_lines_total";
