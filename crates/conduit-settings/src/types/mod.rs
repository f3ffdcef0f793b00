//! Settings types.
//!
//! Every struct uses `camelCase` field names and `#[serde(default)]`, so a
//! settings file only needs to mention the values it overrides.

mod server;
mod transport;

pub use server::{AuthSettings, DispatchSettings, LoggingSettings, ServerSettings};
pub use transport::{CircuitBreakerSettings, HttpSettings, StreamingSettings, WebSocketSettings};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConduitSettings {
    /// Shared network settings.
    pub server: ServerSettings,
    /// Persistent socket transport.
    pub websocket: WebSocketSettings,
    /// Request/response HTTP transport.
    pub http: HttpSettings,
    /// Chunked streaming transport.
    pub streaming: StreamingSettings,
    /// Dispatch pipeline.
    pub dispatch: DispatchSettings,
    /// Credential gate.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl ConduitSettings {
    /// Reject values that would make a transport unusable.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!("{name} must be > 0")));
            }
            Ok(())
        }

        positive("websocket.heartbeatIntervalMs", self.websocket.heartbeat_interval_ms)?;
        positive("websocket.idleTimeoutMs", self.websocket.idle_timeout_ms)?;
        positive("websocket.maxConnections", self.websocket.max_connections as u64)?;
        positive("websocket.maxMessageSize", self.websocket.max_message_size as u64)?;
        positive("http.maxConcurrent", self.http.max_concurrent as u64)?;
        positive("http.requestTimeoutMs", self.http.request_timeout_ms)?;
        positive("http.quotaWindowMs", self.http.quota_window_ms)?;
        positive(
            "http.circuitBreaker.failureThreshold",
            u64::from(self.http.circuit_breaker.failure_threshold),
        )?;
        positive("streaming.idleTimeoutMs", self.streaming.idle_timeout_ms)?;
        positive("streaming.maxLineSize", self.streaming.max_line_size as u64)?;
        positive("dispatch.handlerTimeoutMs", self.dispatch.handler_timeout_ms)?;

        if self.streaming.max_line_size > self.streaming.max_body_size {
            return Err(SettingsError::InvalidValue(
                "streaming.maxLineSize must not exceed streaming.maxBodySize".into(),
            ));
        }
        if self.auth.required && self.auth.tokens.is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.required is set but auth.tokens is empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"http":{"maxConcurrent":2}}"#;
        let s: ConduitSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.http.max_concurrent, 2);
        assert_eq!(s.http.max_queue_depth, HttpSettings::default().max_queue_depth);
        assert_eq!(s.websocket.max_connections, WebSocketSettings::default().max_connections);
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(ConduitSettings::default()).unwrap();
        assert!(v["websocket"]["heartbeatIntervalMs"].is_number());
        assert!(v["http"]["circuitBreaker"]["failureThreshold"].is_number());
        assert!(v["streaming"]["maxLineSize"].is_number());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut s = ConduitSettings::default();
        s.http.max_concurrent = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("http.maxConcurrent"));
    }

    #[test]
    fn validate_rejects_required_auth_without_tokens() {
        let mut s = ConduitSettings::default();
        s.auth.required = true;
        assert!(s.validate().is_err());
        s.auth.tokens.push("secret".into());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validate_rejects_line_larger_than_body() {
        let mut s = ConduitSettings::default();
        s.streaming.max_line_size = s.streaming.max_body_size + 1;
        assert!(s.validate().is_err());
    }
}
