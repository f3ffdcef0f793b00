//! Per-request context and typed metadata.

use std::collections::HashMap;
use std::time::Instant;

use conduit_core::{ConnectionId, MessageId, TransportKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Authenticated principal attached by the credential gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable subject (e.g. a token label).
    pub subject: String,
    /// Credential scheme that produced it.
    pub scheme: String,
}

impl Identity {
    /// Identity for a bearer-token subject.
    pub fn bearer(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            scheme: "bearer".to_string(),
        }
    }
}

/// Rate-limit state observed when the message was admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    /// Configured limit for the window.
    pub limit: u32,
    /// Remaining admissions in the current window.
    pub remaining: u32,
    /// Time until the window resets.
    pub reset_after_ms: u64,
}

/// Known fields plus an open extension map for middleware.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    /// Credential identity, if the connection authenticated.
    pub identity: Option<Identity>,
    /// Rate-limit state, if the transport applies one.
    pub rate_limit: Option<RateLimitSnapshot>,
    /// Middleware-specific data.
    #[serde(default)]
    pub extensions: HashMap<String, Value>,
}

impl RequestMetadata {
    /// Metadata carrying only a rate-limit snapshot.
    pub fn with_rate_limit(snapshot: RateLimitSnapshot) -> Self {
        Self {
            rate_limit: Some(snapshot),
            ..Self::default()
        }
    }

    /// Read an extension value.
    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }

    /// Set an extension value, returning the previous one.
    pub fn set_extension(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.extensions.insert(key.into(), value)
    }
}

/// What a transport knows about a connection when it is admitted.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Transport carrying the connection.
    pub kind: TransportKind,
    /// Identity established at connect time.
    pub identity: Option<Identity>,
}

impl ConnectionInfo {
    /// Unauthenticated connection on `kind`.
    pub fn new(kind: TransportKind) -> Self {
        Self { kind, identity: None }
    }

    /// Attach the identity established by the credential gate.
    #[must_use]
    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }
}

/// State carried through the middleware chain and into the handler.
#[derive(Debug)]
pub struct RequestContext {
    /// Connection the message arrived on.
    pub connection_id: ConnectionId,
    /// Transport carrying the connection.
    pub transport: TransportKind,
    /// Request id (`None` for events).
    pub message_id: Option<MessageId>,
    /// Method name.
    pub method: String,
    /// Typed metadata plus extensions.
    pub metadata: RequestMetadata,
    /// Span the dispatch runs in.
    pub span: tracing::Span,
    /// Cancelled when the handler deadline elapses or the connection closes.
    pub cancel: CancellationToken,
    /// When the message arrived.
    pub received_at: Instant,
}

impl RequestContext {
    /// Context for a message on a connection.
    pub fn new(
        connection_id: ConnectionId,
        transport: TransportKind,
        message_id: Option<MessageId>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            connection_id,
            transport,
            message_id,
            method: method.into(),
            metadata: RequestMetadata::default(),
            span: tracing::Span::none(),
            cancel: CancellationToken::new(),
            received_at: Instant::now(),
        }
    }

    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_serializes_camel_case() {
        let meta = RequestMetadata {
            identity: Some(Identity::bearer("ops")),
            rate_limit: Some(RateLimitSnapshot {
                limit: 10,
                remaining: 3,
                reset_after_ms: 500,
            }),
            extensions: HashMap::new(),
        };
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["identity"]["scheme"], "bearer");
        assert_eq!(v["rateLimit"]["resetAfterMs"], 500);
    }

    #[test]
    fn extensions_round_trip() {
        let mut meta = RequestMetadata::default();
        assert!(meta.set_extension("tenant", json!("acme")).is_none());
        assert_eq!(meta.extension("tenant"), Some(&json!("acme")));
        assert_eq!(meta.set_extension("tenant", json!("other")), Some(json!("acme")));
    }

    #[test]
    fn new_context_is_not_cancelled() {
        let ctx = RequestContext::new(ConnectionId::new(), TransportKind::Http, None, "ping");
        assert!(!ctx.is_cancelled());
        ctx.cancel.cancel();
        assert!(ctx.is_cancelled());
    }
}
