//! Streaming sessions and their outbound write path.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use conduit_core::{ConnectionId, Message, SessionId};
use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Request body finished.
    Eof,
    /// Reading the request body failed.
    ReadError,
    /// Total body bytes passed the limit.
    BodyTooLarge,
    /// A line or pending fragment passed the limit.
    LineTooLong,
    /// No chunk within the idle timeout.
    IdleTimeout,
    /// The transport is stopping.
    Shutdown,
}

impl Termination {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eof => "eof",
            Self::ReadError => "read_error",
            Self::BodyTooLarge => "body_too_large",
            Self::LineTooLong => "line_too_long",
            Self::IdleTimeout => "idle_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

type Chunk = (Bytes, oneshot::Sender<()>);

/// One live `POST /mcp/stream` exchange.
pub struct StreamSession {
    /// Client-visible session id.
    pub session_id: SessionId,
    /// Id the dispatcher knows the session by.
    pub connection_id: ConnectionId,
    /// When the session was admitted.
    pub started_at: Instant,
    writer: Mutex<mpsc::Sender<Chunk>>,
    cancel: CancellationToken,
    cleaned_up: AtomicBool,
}

impl StreamSession {
    /// New session plus the response body stream that drains its writes.
    pub(crate) fn new(
        session_id: SessionId,
    ) -> (
        Arc<Self>,
        impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
    ) {
        let (tx, mut rx) = mpsc::channel::<Chunk>(1);
        let cancel = CancellationToken::new();
        let session = Arc::new(Self {
            session_id,
            connection_id: ConnectionId::new(),
            started_at: Instant::now(),
            writer: Mutex::new(tx),
            cancel: cancel.clone(),
            cleaned_up: AtomicBool::new(false),
        });

        let body = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => None,
                    next = rx.recv() => next,
                };
                let Some((bytes, ack)) = next else { break };
                yield Ok::<_, Infallible>(bytes);
                // Resumed once the body consumer polls again, i.e. after it
                // took the chunk.
                let _ = ack.send(());
            }
        };
        (session, body)
    }

    /// Write one message as a line. Resolves once the response body has
    /// taken it; at most one write is outstanding per session.
    pub async fn write(&self, message: &Message) -> Result<(), TransportError> {
        let line = Bytes::from(message.to_line()?);
        let writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(self.closed());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if writer.send((line, ack_tx)).await.is_err() {
            return Err(self.closed());
        }
        tokio::select! {
            acked = ack_rx => acked.map_err(|_| self.closed()),
            () = self.cancel.cancelled() => Err(self.closed()),
        }
    }

    /// Whether the session has been told to end.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// End the response stream.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Claim the one-time cleanup.
    pub(crate) fn begin_cleanup(&self) -> bool {
        !self.cleaned_up.swap(true, Ordering::AcqRel)
    }

    fn closed(&self) -> TransportError {
        TransportError::ConnectionClosed(self.connection_id.clone())
    }
}

/// The session id is already live.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session {0} is already active")]
pub struct SessionConflict(pub SessionId);

#[derive(Default)]
struct Maps {
    by_session: HashMap<SessionId, Arc<StreamSession>>,
    by_connection: HashMap<ConnectionId, Arc<StreamSession>>,
}

/// Live sessions, addressable by session id or connection id.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    maps: RwLock<Maps>,
}

impl SessionRegistry {
    pub(crate) fn try_insert(&self, session: Arc<StreamSession>) -> Result<(), SessionConflict> {
        let mut maps = self.maps.write();
        if maps.by_session.contains_key(&session.session_id) {
            return Err(SessionConflict(session.session_id.clone()));
        }
        let _ = maps
            .by_connection
            .insert(session.connection_id.clone(), Arc::clone(&session));
        let _ = maps.by_session.insert(session.session_id.clone(), session);
        Ok(())
    }

    pub(crate) fn remove(&self, session: &StreamSession) {
        let mut maps = self.maps.write();
        let _ = maps.by_session.remove(&session.session_id);
        let _ = maps.by_connection.remove(&session.connection_id);
    }

    pub(crate) fn by_connection(&self, id: &ConnectionId) -> Option<Arc<StreamSession>> {
        self.maps.read().by_connection.get(id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<StreamSession>> {
        self.maps.read().by_session.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.maps.read().by_session.len()
    }
}
