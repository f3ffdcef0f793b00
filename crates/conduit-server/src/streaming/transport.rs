//! `StreamingTransport`: NDJSON over a long-lived `POST /mcp/stream`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, CONTENT_TYPE,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use conduit_core::{ConnectionId, Message, SessionId, TransportKind};
use conduit_rpc::{ConnectionHandler, ConnectionInfo, RequestMetadata, RpcError};
use conduit_settings::StreamingSettings;
use futures::StreamExt;
use metrics::{counter, gauge};
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

use super::line_buffer::LineBuffer;
use super::session::{SessionRegistry, StreamSession, Termination};
use crate::auth::{Authenticator, bearer_token};
use crate::dispatch::DispatchQueue;
use crate::metrics::{
    STREAM_LINES_TOTAL, STREAM_SESSIONS_ACTIVE, STREAM_SESSIONS_TOTAL, STREAM_TERMINATIONS_TOTAL,
};
use crate::transport::{BroadcastReport, ListenerLifecycle, Transport, TransportContext, TransportError};

/// Header carrying the client-visible session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

const NDJSON: &str = "application/x-ndjson";

struct StreamShared {
    settings: StreamingSettings,
    handler: Arc<dyn ConnectionHandler>,
    authenticator: Arc<dyn Authenticator>,
    sessions: SessionRegistry,
    /// Session readers; closed while the transport is stopping.
    readers: TaskTracker,
}

/// Chunked streaming transport.
///
/// The request body is read as newline-delimited JSON; replies and
/// server-initiated messages are written as lines on the response body.
pub struct StreamingTransport {
    shared: Arc<StreamShared>,
    host: String,
    shutdown_timeout: Duration,
    lifecycle: ListenerLifecycle,
}

impl StreamingTransport {
    /// Build from the shared context and streaming settings.
    pub fn new(context: TransportContext, settings: StreamingSettings) -> Self {
        let shared = StreamShared {
            handler: context.handler,
            authenticator: context.authenticator,
            sessions: SessionRegistry::default(),
            readers: TaskTracker::new(),
            settings,
        };
        Self {
            shared: Arc::new(shared),
            host: context.host,
            shutdown_timeout: context.shutdown_timeout,
            lifecycle: ListenerLifecycle::default(),
        }
    }

    /// The axum router serving this transport.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/mcp/stream", post(handle_stream).options(preflight))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.shared))
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    async fn close_all(&self) {
        self.shared.readers.close();
        for session in self.shared.sessions.all() {
            session.close();
        }
        if tokio::time::timeout(self.shutdown_timeout, self.shared.readers.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.shared.sessions.len(),
                "streaming sessions did not finish within shutdown timeout"
            );
        }
    }
}

async fn preflight() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (
                ACCESS_CONTROL_ALLOW_HEADERS,
                "content-type, authorization, mcp-session-id",
            ),
        ],
    )
}

fn refuse(status: StatusCode, error: RpcError) -> Response {
    (status, Json(error.into_message(None))).into_response()
}

async fn handle_stream(
    State(shared): State<Arc<StreamShared>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let identity = match shared.authenticator.authenticate(bearer_token(&headers)) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "stream refused by credential gate");
            return refuse(StatusCode::UNAUTHORIZED, e.into());
        }
    };
    if shared.readers.is_closed() {
        return refuse(
            StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Internal {
                message: "server shutting down".into(),
            },
        );
    }

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(SessionId::new, SessionId::from);
    let Ok(session_header) = HeaderValue::from_str(session_id.as_str()) else {
        return refuse(
            StatusCode::BAD_REQUEST,
            RpcError::InvalidRequest {
                message: "invalid session id".into(),
            },
        );
    };

    let (session, outbound) = StreamSession::new(session_id);
    if let Err(conflict) = shared.sessions.try_insert(Arc::clone(&session)) {
        debug!(error = %conflict, "duplicate stream session");
        return refuse(
            StatusCode::CONFLICT,
            RpcError::InvalidRequest {
                message: conflict.to_string(),
            },
        );
    }

    counter!(STREAM_SESSIONS_TOTAL).increment(1);
    gauge!(STREAM_SESSIONS_ACTIVE).increment(1.0);
    info!(
        session_id = %session.session_id,
        connection_id = %session.connection_id,
        "stream session opened"
    );
    shared
        .handler
        .on_connect(
            &session.connection_id,
            ConnectionInfo::new(TransportKind::Streaming).with_identity(identity),
        )
        .await;

    drop(shared.readers.spawn(run_reader(Arc::clone(&shared), session, body)));

    let mut response = Body::from_stream(outbound).into_response();
    let headers = response.headers_mut();
    let _ = headers.insert(CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    let _ = headers.insert(SESSION_HEADER, session_header);
    let _ = headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static(SESSION_HEADER));
    response
}

/// Read the request body until a termination condition, dispatching each
/// complete line.
#[instrument(skip_all, fields(session_id = %session.session_id, connection_id = %session.connection_id))]
async fn run_reader(shared: Arc<StreamShared>, session: Arc<StreamSession>, body: Body) {
    let settings = &shared.settings;
    let idle_timeout = settings.idle_timeout();
    let mut chunks = body.into_data_stream();
    let mut lines = LineBuffer::new(settings.max_line_size);
    let mut total = 0usize;
    let cancel = session.cancel_token().clone();
    let (dispatch, mut dispatch_task) = DispatchQueue::spawn(
        Arc::clone(&shared.handler),
        session.connection_id.clone(),
        {
            let session = Arc::clone(&session);
            move |reply: Message| {
                let writer = Arc::clone(&session);
                async move {
                    if let Err(e) = writer.write(&reply).await {
                        debug!(connection_id = %writer.connection_id, error = %e, "failed to deliver reply");
                    }
                }
            }
        },
    );

    let reason = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break Termination::Shutdown,
            next = tokio::time::timeout(idle_timeout, chunks.next()) => next,
        };
        match next {
            Err(_) => break Termination::IdleTimeout,
            Ok(None) => {
                if let Some(line) = lines.finish() {
                    dispatch_line(&dispatch, line);
                }
                break Termination::Eof;
            }
            Ok(Some(Err(e))) => {
                debug!(error = %e, "request body read failed");
                break Termination::ReadError;
            }
            Ok(Some(Ok(chunk))) => {
                total += chunk.len();
                if total > settings.max_body_size {
                    warn!(total, limit = settings.max_body_size, "stream body too large");
                    break Termination::BodyTooLarge;
                }
                match lines.push(&chunk) {
                    Ok(complete) => {
                        for line in complete {
                            dispatch_line(&dispatch, line);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stream line too long");
                        break Termination::LineTooLong;
                    }
                }
            }
        }
    };

    // After a clean EOF, let in-flight replies reach the response before it
    // ends. Otherwise running requests finish on their own.
    drop(dispatch);
    if reason == Termination::Eof {
        tokio::select! {
            _ = &mut dispatch_task => {}
            () = cancel.cancelled() => {}
        }
    }
    cleanup(&shared, &session, reason).await;
}

fn dispatch_line(dispatch: &DispatchQueue, line: String) {
    counter!(STREAM_LINES_TOTAL).increment(1);
    if !dispatch.push(line, RequestMetadata::default()) {
        debug!("dispatch loop gone, dropping line");
    }
}

/// The single teardown path.
async fn cleanup(shared: &StreamShared, session: &StreamSession, reason: Termination) {
    if !session.begin_cleanup() {
        return;
    }
    session.close();
    shared.sessions.remove(session);

    counter!(STREAM_TERMINATIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(STREAM_SESSIONS_ACTIVE).decrement(1.0);
    info!(
        reason = reason.as_str(),
        duration_ms = session.started_at.elapsed().as_millis(),
        "stream session closed"
    );

    shared.handler.on_disconnect(&session.connection_id).await;
}

#[async_trait]
impl Transport for StreamingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    async fn start(&self) -> Result<SocketAddr, TransportError> {
        let _ = self.shared.readers.reopen();
        self.lifecycle
            .start(
                TransportKind::Streaming,
                &self.host,
                self.shared.settings.port,
                self.router(),
                |_| Vec::new(),
            )
            .await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.lifecycle
            .stop(TransportKind::Streaming, self.shutdown_timeout, || self.close_all())
            .await;
        Ok(())
    }

    async fn send(&self, id: &ConnectionId, message: &Message) -> Result<(), TransportError> {
        let session = self
            .shared
            .sessions
            .by_connection(id)
            .ok_or_else(|| TransportError::ConnectionNotFound(id.clone()))?;
        session.write(message).await
    }

    /// Writes to every session concurrently. A session whose client has not
    /// taken the line within the idle timeout is skipped and reported as a
    /// failure; it stays open.
    async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let sessions = self.shared.sessions.all();
        let limit = self.shared.settings.idle_timeout();
        let writes = sessions.iter().map(|s| async move {
            tokio::time::timeout(limit, s.write(message))
                .await
                .unwrap_or_else(|_| Err(TransportError::WriteTimeout(s.connection_id.clone())))
        });
        let results = futures::future::join_all(writes).await;

        let mut report = BroadcastReport::default();
        for (session, result) in sessions.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => report.failures.push((session.connection_id.clone(), e)),
            }
        }
        report
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }
}
