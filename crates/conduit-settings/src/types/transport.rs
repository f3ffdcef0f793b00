//! Per-transport settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Persistent WebSocket transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    /// Whether the transport is started by the server.
    pub enabled: bool,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent connections; further upgrades are closed with 1013.
    pub max_connections: usize,
    /// Ping cadence and liveness check cadence, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close connections idle for longer than this, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Outbound buffered-bytes limit per connection.
    pub high_water_mark: usize,
    /// Inbound messages allowed per one-second window.
    pub messages_per_second: u32,
    /// Inbound messages allowed per one-minute window.
    pub messages_per_minute: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8765,
            max_connections: 100,
            heartbeat_interval_ms: 30_000,
            idle_timeout_ms: 300_000,
            max_message_size: 1024 * 1024,
            high_water_mark: 4 * 1024 * 1024,
            messages_per_second: 50,
            messages_per_minute: 1_000,
        }
    }
}

impl WebSocketSettings {
    /// Heartbeat cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Circuit breaker settings for the HTTP transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerSettings {
    /// Failure count that opens the breaker.
    pub failure_threshold: u32,
    /// Time spent open before probing, in milliseconds.
    pub cooldown_ms: u64,
    /// Consecutive half-open successes needed to close again.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_successes: 3,
        }
    }
}

impl CircuitBreakerSettings {
    /// Open-state cooldown.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Request/response HTTP transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    /// Whether the transport is started by the server.
    pub enabled: bool,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// In-flight request limit.
    pub max_concurrent: usize,
    /// Requests allowed to wait for a slot; beyond this they get 503.
    pub max_queue_depth: usize,
    /// Deadline for producing a reply, in milliseconds.
    pub request_timeout_ms: u64,
    /// Requests allowed per client per quota window.
    pub quota_limit: u32,
    /// Quota window length, in milliseconds.
    pub quota_window_ms: u64,
    /// Header carrying the client identifier used as the quota key.
    pub client_id_header: String,
    /// Largest accepted request body in bytes.
    pub max_body_size: usize,
    /// Circuit breaker tuning.
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8766,
            max_concurrent: 64,
            max_queue_depth: 128,
            request_timeout_ms: 30_000,
            quota_limit: 600,
            quota_window_ms: 60_000,
            client_id_header: "x-client-id".to_string(),
            max_body_size: 4 * 1024 * 1024,
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

impl HttpSettings {
    /// Reply deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Quota window length.
    pub fn quota_window(&self) -> Duration {
        Duration::from_millis(self.quota_window_ms)
    }
}

/// Chunked streaming transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingSettings {
    /// Whether the transport is started by the server.
    pub enabled: bool,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Close sessions with no inbound chunk for this long, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Total request body limit per session in bytes.
    pub max_body_size: usize,
    /// Largest single line (incomplete fragment included) in bytes.
    pub max_line_size: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8767,
            idle_timeout_ms: 300_000,
            max_body_size: 64 * 1024 * 1024,
            max_line_size: 4 * 1024 * 1024,
        }
    }
}

impl StreamingSettings {
    /// Session idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
