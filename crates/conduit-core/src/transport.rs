//! Transport kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which wire transport carries a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent bidirectional WebSocket.
    WebSocket,
    /// One HTTP request, one reply.
    Http,
    /// Long-lived chunked NDJSON body pair.
    Streaming,
}

impl TransportKind {
    /// Lowercase label used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Http => "http",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
