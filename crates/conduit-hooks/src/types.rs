//! Hook phases and the context handed to each hook.

use conduit_core::{ConnectionId, ErrorBody, MessageId, TransportKind};
use serde::{Deserialize, Serialize};

/// Lifecycle point at which a hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPhase {
    /// A connection was admitted by its transport.
    Connect,
    /// A connection was cleaned up.
    Disconnect,
    /// A message parsed, before the middleware chain.
    Request,
    /// Right before the method is invoked.
    BeforeInvoke,
    /// Right after the method returned (success or failure).
    AfterInvoke,
    /// A request completed successfully.
    Response,
    /// A request or event failed.
    Error,
}

impl HookPhase {
    /// Returns all phases.
    #[must_use]
    pub fn all() -> &'static [HookPhase] {
        &[
            Self::Connect,
            Self::Disconnect,
            Self::Request,
            Self::BeforeInvoke,
            Self::AfterInvoke,
            Self::Response,
            Self::Error,
        ]
    }
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "Connect"),
            Self::Disconnect => write!(f, "Disconnect"),
            Self::Request => write!(f, "Request"),
            Self::BeforeInvoke => write!(f, "BeforeInvoke"),
            Self::AfterInvoke => write!(f, "AfterInvoke"),
            Self::Response => write!(f, "Response"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// What a hook gets to look at.
///
/// Hooks are observational, so the context is an owned snapshot rather than
/// a handle into the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookContext {
    /// Phase being fired.
    pub phase: HookPhase,
    /// Connection the event belongs to.
    pub connection_id: ConnectionId,
    /// Transport carrying the connection.
    pub transport: TransportKind,
    /// Method name, when the phase concerns a message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request id, when the message carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Normalized failure for the `Error` and `AfterInvoke` phases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Elapsed time since the message arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// RFC 3339 time the context was built.
    pub timestamp: String,
}

impl HookContext {
    /// Context for `phase` on a connection.
    pub fn new(phase: HookPhase, connection_id: ConnectionId, transport: TransportKind) -> Self {
        Self {
            phase,
            connection_id,
            transport,
            method: None,
            message_id: None,
            error: None,
            duration_ms: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Attach the method name.
    #[must_use]
    pub fn with_method(mut self, method: Option<&str>) -> Self {
        self.method = method.map(String::from);
        self
    }

    /// Attach the request id.
    #[must_use]
    pub fn with_message_id(mut self, id: Option<MessageId>) -> Self {
        self.message_id = id;
        self
    }

    /// Attach a failure.
    #[must_use]
    pub fn with_error(mut self, error: ErrorBody) -> Self {
        self.error = Some(error);
        self
    }

    /// Attach an elapsed duration.
    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    /// Same context re-targeted at another phase.
    #[must_use]
    pub fn for_phase(&self, phase: HookPhase) -> Self {
        Self {
            phase,
            timestamp: chrono::Utc::now().to_rfc3339(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_variant_names() {
        for phase in HookPhase::all() {
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json, phase.to_string());
        }
    }

    #[test]
    fn context_serializes_camel_case_and_skips_empty() {
        let ctx = HookContext::new(HookPhase::Request, ConnectionId::from("c1"), TransportKind::Http)
            .with_method(Some("ping"))
            .with_message_id(Some(MessageId::Number(7)));
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["connectionId"], "c1");
        assert_eq!(json["transport"], "http");
        assert_eq!(json["method"], "ping");
        assert_eq!(json["messageId"], 7);
        assert!(json.get("error").is_none());
        assert!(json.get("durationMs").is_none());
    }

    #[test]
    fn for_phase_keeps_fields() {
        let ctx = HookContext::new(HookPhase::Request, ConnectionId::from("c1"), TransportKind::WebSocket)
            .with_method(Some("echo"));
        let next = ctx.for_phase(HookPhase::Response);
        assert_eq!(next.phase, HookPhase::Response);
        assert_eq!(next.method.as_deref(), Some("echo"));
        assert_eq!(next.connection_id, ctx.connection_id);
    }
}
