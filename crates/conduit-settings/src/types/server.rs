//! Server-wide, dispatch, auth, and logging settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shared network settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address for every transport.
    pub host: String,
    /// Grace period for in-flight work during shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl ServerSettings {
    /// Shutdown grace period.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Dispatch pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Per-call deadline for method invocation, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Invocations slower than this are logged as slow, in milliseconds.
    pub slow_request_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 60_000,
            slow_request_ms: 5_000,
        }
    }
}

impl DispatchSettings {
    /// Per-call handler deadline.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Slow-request logging threshold.
    pub fn slow_request(&self) -> Duration {
        Duration::from_millis(self.slow_request_ms)
    }
}

/// Credential gate settings.
///
/// Only the gating contract lives in this crate; the accepted tokens are
/// plain configuration input.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Reject connections without a valid credential.
    pub required: bool,
    /// Accepted bearer tokens.
    pub tokens: Vec<String>,
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON records instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
