//! `WebSocketTransport`: upgrade route, admission, and the transport API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use conduit_core::{ConnectionId, Message, TransportKind};
use conduit_settings::WebSocketSettings;
use metrics::counter;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::connection::CloseReason;
use super::registry::ConnectionRegistry;
use super::session::{WsShared, reject, run_ws_session};
use crate::auth::bearer_token;
use crate::metrics::WS_REJECTED_TOTAL;
use crate::transport::{BroadcastReport, ListenerLifecycle, Transport, TransportContext, TransportError};

/// Persistent bidirectional transport on `GET /ws`.
pub struct WebSocketTransport {
    shared: Arc<WsShared>,
    host: String,
    shutdown_timeout: Duration,
    lifecycle: ListenerLifecycle,
}

impl WebSocketTransport {
    /// Build from the shared context and WebSocket settings.
    pub fn new(context: TransportContext, settings: WebSocketSettings) -> Self {
        let shared = WsShared {
            registry: ConnectionRegistry::new(settings.max_connections),
            handler: context.handler,
            authenticator: context.authenticator,
            sessions: TaskTracker::new(),
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
            .route("/ws", get(handle_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.shared))
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    async fn close_all(&self) {
        self.shared.sessions.close();
        let live = self.shared.registry.all();
        debug!(count = live.len(), "closing live connections");
        for connection in live {
            connection.request_close(CloseReason::ServerShutdown);
        }
        if tokio::time::timeout(self.shutdown_timeout, self.shared.sessions.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.shared.registry.len(),
                "websocket sessions did not finish within shutdown timeout"
            );
        }
    }
}

async fn handle_upgrade(
    State(shared): State<Arc<WsShared>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    // Frames above the soft limit get an error reply; the hard cap ends the
    // connection.
    let hard_cap = shared.settings.max_message_size.saturating_mul(4);
    let ws = ws.max_message_size(hard_cap).max_frame_size(hard_cap);

    let admission = if shared.sessions.is_closed() {
        Err(CloseReason::ServerShutdown)
    } else {
        match shared.authenticator.authenticate(bearer_token(&headers)) {
            Err(e) => {
                debug!(error = %e, "websocket refused by credential gate");
                Err(CloseReason::PolicyViolation)
            }
            Ok(identity) => match shared.registry.try_reserve() {
                Some(slot) => Ok((identity, slot)),
                None => Err(CloseReason::AtCapacity),
            },
        }
    };

    ws.on_upgrade(move |socket| async move {
        match admission {
            Ok((identity, slot)) => {
                let session = run_ws_session(
                    socket,
                    ConnectionId::new(),
                    identity,
                    Arc::clone(&shared),
                    slot,
                );
                shared.sessions.track_future(session).await;
            }
            Err(reason) => {
                counter!(WS_REJECTED_TOTAL, "reason" => reason.as_str()).increment(1);
                debug!(code = reason.code(), reason = reason.as_str(), "refusing websocket");
                reject(socket, reason).await;
            }
        }
    })
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn start(&self) -> Result<SocketAddr, TransportError> {
        let _ = self.shared.sessions.reopen();
        self.lifecycle
            .start(
                TransportKind::WebSocket,
                &self.host,
                self.shared.settings.port,
                self.router(),
                |_| Vec::new(),
            )
            .await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.lifecycle
            .stop(TransportKind::WebSocket, self.shutdown_timeout, || self.close_all())
            .await;
        Ok(())
    }

    async fn send(&self, id: &ConnectionId, message: &Message) -> Result<(), TransportError> {
        let connection = self
            .shared
            .registry
            .get(id)
            .ok_or_else(|| TransportError::ConnectionNotFound(id.clone()))?;
        connection.send(message)
    }

    async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let live = self.shared.registry.all();
        let mut report = BroadcastReport::default();
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast");
                report.failures = live
                    .iter()
                    .map(|c| {
                        let err = <serde_json::Error as serde::ser::Error>::custom(e.to_string());
                        (c.id.clone(), TransportError::Serialize(err))
                    })
                    .collect();
                return report;
            }
        };
        for connection in live {
            match connection.send_text(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => report.failures.push((connection.id.clone(), e)),
            }
        }
        report
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }
}
