//! `ConduitServer`: the enabled transports over one shared handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::TransportKind;
use conduit_rpc::ConnectionHandler;
use conduit_settings::ConduitSettings;
use tracing::{info, warn};

use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::http::HttpTransport;
use crate::shutdown::ShutdownCoordinator;
use crate::streaming::StreamingTransport;
use crate::transport::{Transport, TransportContext, TransportError};
use crate::websocket::WebSocketTransport;

/// Owns every enabled transport. All of them feed the same handler,
/// normally an `Arc<Dispatcher>`.
pub struct ConduitServer {
    transports: Vec<Arc<dyn Transport>>,
    shutdown: ShutdownCoordinator,
    shutdown_timeout: Duration,
}

impl ConduitServer {
    /// Build the transports enabled in `settings`, gated by the configured
    /// static tokens.
    pub fn new(settings: &ConduitSettings, handler: Arc<dyn ConnectionHandler>) -> Self {
        let authenticator = Arc::new(StaticTokenAuthenticator::from_settings(&settings.auth));
        Self::with_authenticator(settings, handler, authenticator)
    }

    /// Build with a custom credential gate.
    pub fn with_authenticator(
        settings: &ConduitSettings,
        handler: Arc<dyn ConnectionHandler>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let context = TransportContext::new(settings.server.host.clone(), handler, authenticator)
            .with_shutdown_timeout(settings.server.shutdown_timeout());

        let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
        if settings.websocket.enabled {
            transports.push(Arc::new(WebSocketTransport::new(
                context.clone(),
                settings.websocket.clone(),
            )));
        }
        if settings.http.enabled {
            transports.push(Arc::new(HttpTransport::new(
                context.clone(),
                settings.http.clone(),
            )));
        }
        if settings.streaming.enabled {
            transports.push(Arc::new(StreamingTransport::new(
                context,
                settings.streaming.clone(),
            )));
        }

        Self {
            transports,
            shutdown: ShutdownCoordinator::new(),
            shutdown_timeout: settings.server.shutdown_timeout(),
        }
    }

    /// Start every transport. If one fails to start, those already started
    /// are stopped again.
    pub async fn start(&self) -> Result<Vec<(TransportKind, SocketAddr)>, TransportError> {
        let mut bound = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            match transport.start().await {
                Ok(addr) => bound.push((transport.kind(), addr)),
                Err(e) => {
                    warn!(transport = %transport.kind(), error = %e, "transport failed to start");
                    for (kind, _) in &bound {
                        if let Some(started) = self.transport(*kind) {
                            let _ = started.stop().await;
                        }
                    }
                    return Err(e);
                }
            }
        }
        info!(transports = bound.len(), "server started");
        Ok(bound)
    }

    /// Stop every transport concurrently.
    pub async fn stop(&self) {
        let stops = self.transports.iter().map(|t| t.stop());
        for result in futures::future::join_all(stops).await {
            if let Err(e) = result {
                warn!(error = %e, "transport failed to stop cleanly");
            }
        }
        info!("server stopped");
    }

    /// Wait for [`shutdown_handle`](Self::shutdown_handle) to fire, then
    /// stop, bounded by twice the shutdown timeout.
    pub async fn run_until_shutdown(&self) {
        self.shutdown.cancelled().await;
        info!(timeout_ms = self.shutdown_timeout.as_millis(), "shutdown requested");
        if tokio::time::timeout(self.shutdown_timeout * 2, self.stop())
            .await
            .is_err()
        {
            warn!("transports did not stop in time");
        }
    }

    /// Coordinator that triggers [`run_until_shutdown`](Self::run_until_shutdown).
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    /// The transport of `kind`, if enabled.
    pub fn transport(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.kind() == kind)
    }

    /// Enabled transports.
    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }
}
