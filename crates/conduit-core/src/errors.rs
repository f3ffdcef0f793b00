//! Wire error codes and the failure taxonomy.
//!
//! Every failure the server can report belongs to one [`FailureClass`].
//! All classes except [`FailureClass::TransportFatal`] are converted into an
//! error message on the same channel; transport-fatal failures tear the
//! connection down instead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved error codes (JSON-RPC style negative integers).
pub mod codes {
    /// Message could not be parsed as JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// JSON parsed but is not a valid message.
    pub const INVALID_REQUEST: i32 = -32600;
    /// No handler for the requested method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Arguments rejected by the handler.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Unexpected server-side failure.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Inbound frame exceeds the configured size limit.
    pub const MESSAGE_TOO_LARGE: i32 = -32001;
    /// Per-connection message rate exceeded.
    pub const RATE_LIMIT_EXCEEDED: i32 = -32002;
    /// Per-client request quota exceeded.
    pub const QUOTA_EXCEEDED: i32 = -32003;
    /// Dispatch exceeded its deadline.
    pub const REQUEST_TIMEOUT: i32 = -32004;
    /// Credential missing or rejected.
    pub const UNAUTHORIZED: i32 = -32005;
    /// Concurrency limit and queue both full.
    pub const SERVER_OVERLOADED: i32 = -32006;
    /// Circuit breaker is open.
    pub const CIRCUIT_OPEN: i32 = -32007;

    /// Symbolic name for a code, used in logs and metric labels.
    pub fn name(code: i32) -> &'static str {
        match code {
            PARSE_ERROR => "parse_error",
            INVALID_REQUEST => "invalid_request",
            METHOD_NOT_FOUND => "method_not_found",
            INVALID_PARAMS => "invalid_params",
            INTERNAL_ERROR => "internal_error",
            MESSAGE_TOO_LARGE => "message_too_large",
            RATE_LIMIT_EXCEEDED => "rate_limit_exceeded",
            QUOTA_EXCEEDED => "quota_exceeded",
            REQUEST_TIMEOUT => "request_timeout",
            UNAUTHORIZED => "unauthorized",
            SERVER_OVERLOADED => "server_overloaded",
            CIRCUIT_OPEN => "circuit_open",
            _ => "application_error",
        }
    }
}

/// Classification of a failure by how it is recovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Malformed or unparseable message. Reported per message; the
    /// connection survives.
    Protocol,
    /// Rejected before dispatch (auth, quota, breaker, overload). No handler
    /// runs.
    Admission,
    /// Dispatch exceeded its deadline. The underlying work may still run.
    Timeout,
    /// The invoked method returned a typed failure.
    Handler,
    /// I/O failure or protocol desync. The connection is torn down.
    TransportFatal,
}

impl FailureClass {
    /// Whether this failure is reported to the client as an error message.
    pub fn is_reportable(self) -> bool {
        !matches!(self, Self::TransportFatal)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::Admission => "admission",
            Self::Timeout => "timeout",
            Self::Handler => "handler",
            Self::TransportFatal => "transport_fatal",
        };
        f.write_str(s)
    }
}
