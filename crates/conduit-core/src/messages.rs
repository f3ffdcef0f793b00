//! Wire message model shared by every transport.
//!
//! All transports exchange the same JSON shape:
//!
//! ```text
//! {"type": "request"|"response"|"error"|"event", "id"?, "method"?, "params"?, "result"?, "error"?}
//! ```
//!
//! `id` correlates a [`Message::Request`] with exactly one
//! [`Message::Response`] or [`Message::Error`]. Events carry no id and never
//! get a reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation id of a request. Clients may use strings or integers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// Structured error body carried by [`Message::Error`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Reserved negative error code (see [`crate::errors::codes`]).
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorBody {
    /// Build an error body without details.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// One protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Client → server call expecting exactly one reply.
    Request {
        /// Correlation id, unique among the connection's in-flight requests.
        id: MessageId,
        /// Method name.
        method: String,
        /// Method arguments.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// Successful reply to a request.
    Response {
        /// Echoed request id.
        id: MessageId,
        /// Result payload.
        result: Value,
    },
    /// Failed reply, or an unsolicited protocol error when `id` is null.
    Error {
        /// Echoed request id; `None` when the request could not be parsed.
        #[serde(default)]
        id: Option<MessageId>,
        /// Error details.
        error: ErrorBody,
    },
    /// One-way notification in either direction.
    Event {
        /// Event name.
        method: String,
        /// Event payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

impl Message {
    /// Build a request.
    pub fn request(id: impl Into<MessageId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Build a success response.
    pub fn response(id: MessageId, result: Value) -> Self {
        Self::Response { id, result }
    }

    /// Build an error reply.
    pub fn error(id: Option<MessageId>, error: ErrorBody) -> Self {
        Self::Error { id, error }
    }

    /// Build an event.
    pub fn event(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Event {
            method: method.into(),
            params,
        }
    }

    /// Correlation id, if this variant carries one.
    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(id),
            Self::Error { id, .. } => id.as_ref(),
            Self::Event { .. } => None,
        }
    }

    /// Method name for requests and events.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request { method, .. } | Self::Event { method, .. } => Some(method),
            Self::Response { .. } | Self::Error { .. } => None,
        }
    }

    /// Lowercase variant name as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::Event { .. } => "event",
        }
    }

    /// Whether this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Serialize to a compact JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Serialize to one newline-terminated line for line-framed transports.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}
