//! Typed dispatch failures and their wire normalization.

use conduit_core::errors::codes;
use conduit_core::{ErrorBody, FailureClass, Message, MessageId};
use serde_json::{Value, json};

/// Failure produced anywhere in the dispatch pipeline.
///
/// Every variant maps to a reserved wire code via [`code`](Self::code) and
/// to a recovery class via [`class`](Self::class).
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Inbound text was not valid JSON.
    #[error("parse error: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },

    /// Valid JSON with the wrong shape.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What is wrong with the message.
        message: String,
    },

    /// No handler registered under the method name.
    #[error("method '{method}' not found")]
    MethodNotFound {
        /// Requested method.
        method: String,
    },

    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// Internal server error.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Frame larger than the configured maximum.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Received size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Per-connection message rate exceeded.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Time until the exhausted window rolls over.
        retry_after_ms: u64,
    },

    /// Per-client request quota exhausted.
    #[error("quota exceeded")]
    QuotaExceeded {
        /// Whole seconds until the quota window resets.
        retry_after_secs: u64,
    },

    /// Dispatch exceeded its deadline.
    #[error("timeout after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// Missing or rejected credential.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Why the credential was rejected.
        message: String,
    },

    /// Concurrency limit reached and the wait queue is full.
    #[error("server overloaded")]
    Overloaded,

    /// Circuit breaker is open.
    #[error("service unavailable: circuit open")]
    CircuitOpen,

    /// Domain-specific error with an arbitrary code.
    #[error("{message}")]
    Custom {
        /// Wire code.
        code: i32,
        /// Human-readable message.
        message: String,
        /// Optional structured details.
        data: Option<Value>,
    },
}

impl RpcError {
    /// Wire error code for this variant.
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse { .. } => codes::PARSE_ERROR,
            Self::InvalidRequest { .. } => codes::INVALID_REQUEST,
            Self::MethodNotFound { .. } => codes::METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => codes::INVALID_PARAMS,
            Self::Internal { .. } => codes::INTERNAL_ERROR,
            Self::MessageTooLarge { .. } => codes::MESSAGE_TOO_LARGE,
            Self::RateLimited { .. } => codes::RATE_LIMIT_EXCEEDED,
            Self::QuotaExceeded { .. } => codes::QUOTA_EXCEEDED,
            Self::Timeout { .. } => codes::REQUEST_TIMEOUT,
            Self::Unauthorized { .. } => codes::UNAUTHORIZED,
            Self::Overloaded => codes::SERVER_OVERLOADED,
            Self::CircuitOpen => codes::CIRCUIT_OPEN,
            Self::Custom { code, .. } => *code,
        }
    }

    /// Recovery class.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Parse { .. }
            | Self::InvalidRequest { .. }
            | Self::MethodNotFound { .. }
            | Self::MessageTooLarge { .. } => FailureClass::Protocol,
            Self::RateLimited { .. }
            | Self::QuotaExceeded { .. }
            | Self::Unauthorized { .. }
            | Self::Overloaded
            | Self::CircuitOpen => FailureClass::Admission,
            Self::Timeout { .. } => FailureClass::Timeout,
            Self::InvalidParams { .. } | Self::Internal { .. } | Self::Custom { .. } => {
                FailureClass::Handler
            }
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        let body = ErrorBody::new(self.code(), self.to_string());
        let data = match self {
            Self::MessageTooLarge { size, limit } => Some(json!({ "size": size, "limit": limit })),
            Self::RateLimited { retry_after_ms } => Some(json!({ "retryAfterMs": retry_after_ms })),
            Self::QuotaExceeded { retry_after_secs } => {
                Some(json!({ "retryAfterSecs": retry_after_secs }))
            }
            Self::Custom { data, .. } => data.clone(),
            _ => None,
        };
        match data {
            Some(data) => body.with_data(data),
            None => body,
        }
    }

    /// Wrap as an error message correlated with `id`.
    pub fn into_message(self, id: Option<MessageId>) -> Message {
        Message::error(id, self.to_error_body())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams {
            message: format!("invalid params: {err}"),
        }
    }
}

/// Turn the outcome of a request into its single reply.
pub fn normalize(id: MessageId, outcome: Result<Value, RpcError>) -> Message {
    match outcome {
        Ok(result) => Message::response(id, result),
        Err(err) => err.into_message(Some(id)),
    }
}

/// Best-effort extraction of a request id from raw text.
///
/// Used when the typed parse fails (or the dispatch task dies) so the error
/// can still be correlated.
pub fn extract_request_id(raw: &str) -> Option<MessageId> {
    let value: Value = serde_json::from_str(raw).ok()?;
    id_from_value(&value)
}

pub(crate) fn id_from_value(value: &Value) -> Option<MessageId> {
    let id = value.get("id")?;
    match id {
        Value::String(_) | Value::Number(_) => serde_json::from_value(id.clone()).ok(),
        _ => None,
    }
}
