//! The contract every transport implements, plus the listener lifecycle
//! the three built-in transports share.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use conduit_core::{ConnectionId, FailureClass, Message, TransportKind};
use conduit_rpc::ConnectionHandler;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::auth::Authenticator;
use crate::shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};

/// Transport-level failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `start` was called on a running transport.
    #[error("transport already started")]
    AlreadyStarted,
    /// The operation needs a running transport.
    #[error("transport not started")]
    NotStarted,
    /// No live connection with this id.
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),
    /// The connection is closing or closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    /// The peer did not take a write in time.
    #[error("write to connection {0} timed out")]
    WriteTimeout(ConnectionId),
    /// Outbound buffer would exceed its high-water mark; nothing was queued.
    #[error("backpressure: {buffered} bytes buffered, limit {limit}")]
    Backpressure {
        /// Bytes already buffered.
        buffered: usize,
        /// Configured high-water mark.
        limit: usize,
    },
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Outbound message could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The transport cannot address connections directly.
    #[error("{0} transport does not support server-initiated sends")]
    Unsupported(TransportKind),
}

impl TransportError {
    /// Recovery class.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Backpressure { .. } => FailureClass::Admission,
            Self::Serialize(_) => FailureClass::Protocol,
            Self::AlreadyStarted
            | Self::NotStarted
            | Self::ConnectionNotFound(_)
            | Self::ConnectionClosed(_)
            | Self::WriteTimeout(_)
            | Self::Bind { .. }
            | Self::Unsupported(_) => FailureClass::TransportFatal,
        }
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Connections the message was handed to.
    pub delivered: usize,
    /// Connections that refused it.
    pub failures: Vec<(ConnectionId, TransportError)>,
}

impl BroadcastReport {
    /// Whether every connection took the message.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A server-side transport.
///
/// Inbound traffic goes to the [`ConnectionHandler`] in the
/// [`TransportContext`] the transport was built with.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Bind and start accepting. Fails with `AlreadyStarted` if running.
    async fn start(&self) -> Result<SocketAddr, TransportError>;

    /// Stop accepting, close live connections, and wait for them to clean
    /// up within the shutdown timeout. A no-op if not running.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Deliver one message to one connection.
    async fn send(&self, id: &ConnectionId, message: &Message) -> Result<(), TransportError>;

    /// Deliver one message to every live connection.
    async fn broadcast(&self, message: &Message) -> BroadcastReport;

    /// Bound address while running.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// What every transport needs besides its own settings.
#[derive(Clone)]
pub struct TransportContext {
    /// Bind host.
    pub host: String,
    /// Grace period used by `stop`.
    pub shutdown_timeout: Duration,
    /// Receives connection lifecycle and inbound messages.
    pub handler: Arc<dyn ConnectionHandler>,
    /// Credential gate.
    pub authenticator: Arc<dyn Authenticator>,
}

impl TransportContext {
    /// Context bound to `host` with the default shutdown timeout.
    pub fn new(
        host: impl Into<String>,
        handler: Arc<dyn ConnectionHandler>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            host: host.into(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            handler,
            authenticator,
        }
    }

    /// Override the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: ShutdownCoordinator,
    handles: Vec<JoinHandle<()>>,
}

/// Start/stop bookkeeping for an axum listener plus background tasks.
#[derive(Default)]
pub(crate) struct ListenerLifecycle {
    running: tokio::sync::Mutex<Option<Running>>,
    addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl ListenerLifecycle {
    /// Bind `host:port` and serve `router` until stopped. `background` may
    /// spawn extra tasks that watch the shutdown token.
    pub(crate) async fn start(
        &self,
        kind: TransportKind,
        host: &str,
        port: u16,
        router: Router,
        background: impl FnOnce(CancellationToken) -> Vec<JoinHandle<()>>,
    ) -> Result<SocketAddr, TransportError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let bind = format!("{host}:{port}");
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|source| TransportError::Bind {
                addr: bind.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: bind.clone(),
            source,
        })?;

        let shutdown = ShutdownCoordinator::new();
        let token = shutdown.token();
        let serve_token = token.clone();
        let server = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(serve_token.cancelled_owned())
                .await
            {
                error!(transport = %kind, error = %e, "server error");
            }
        });

        let mut handles = vec![server];
        handles.extend(background(token));

        info!(transport = %kind, %addr, "transport listening");
        *self.addr.lock() = Some(addr);
        *running = Some(Running {
            addr,
            shutdown,
            handles,
        });
        Ok(addr)
    }

    /// Cancel the shutdown token, run `close_live` so long-lived connections
    /// finish, then wait for the server and background tasks.
    pub(crate) async fn stop<F, Fut>(&self, kind: TransportKind, timeout: Duration, close_live: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        info!(transport = %kind, addr = %running.addr, "transport stopping");
        running.shutdown.shutdown();
        close_live().await;
        let _ = running
            .shutdown
            .graceful_shutdown(running.handles, Some(timeout))
            .await;
        *self.addr.lock() = None;
        info!(transport = %kind, "transport stopped");
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.addr.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes() {
        assert_eq!(
            TransportError::Backpressure { buffered: 1, limit: 1 }.class(),
            FailureClass::Admission
        );
        assert_eq!(
            TransportError::ConnectionClosed(ConnectionId::from("c")).class(),
            FailureClass::TransportFatal
        );
        assert_eq!(TransportError::NotStarted.class(), FailureClass::TransportFatal);
    }

    #[test]
    fn broadcast_report_completeness() {
        let mut report = BroadcastReport::default();
        assert!(report.is_complete());
        report
            .failures
            .push((ConnectionId::from("c"), TransportError::NotStarted));
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn lifecycle_rejects_double_start_and_tolerates_double_stop() {
        let lifecycle = ListenerLifecycle::default();
        let addr = lifecycle
            .start(TransportKind::Http, "127.0.0.1", 0, Router::new(), |_| Vec::new())
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(lifecycle.local_addr(), Some(addr));

        let again = lifecycle
            .start(TransportKind::Http, "127.0.0.1", 0, Router::new(), |_| Vec::new())
            .await;
        assert!(matches!(again, Err(TransportError::AlreadyStarted)));

        lifecycle
            .stop(TransportKind::Http, Duration::from_secs(1), || async {})
            .await;
        assert_eq!(lifecycle.local_addr(), None);
        lifecycle
            .stop(TransportKind::Http, Duration::from_secs(1), || async {})
            .await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let lifecycle = ListenerLifecycle::default();
        let result = lifecycle
            .start(TransportKind::Http, "127.0.0.1", port, Router::new(), |_| Vec::new())
            .await;
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }
}
