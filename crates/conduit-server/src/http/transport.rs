//! `HttpTransport`: routes, admission, and the timed dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use conduit_core::{ConnectionId, Message, MessageId, TransportKind};
use conduit_rpc::errors::extract_request_id;
use conduit_rpc::{
    ConnectionHandler, ConnectionInfo, Identity, RateLimitSnapshot, RequestMetadata, RpcError,
};
use conduit_settings::HttpSettings;
use metrics::histogram;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument, warn};

use super::stats::{HttpStats, Rejection};
use crate::auth::{Authenticator, bearer_token};
use crate::health::{HealthResponse, MetricsResponse, health_check};
use crate::metrics::HTTP_REQUEST_DURATION_SECONDS;
use crate::resilience::{AdmissionQueue, CircuitBreaker, QuotaDecision, QuotaTracker};
use crate::transport::{BroadcastReport, ListenerLifecycle, Transport, TransportContext, TransportError};

struct HttpShared {
    settings: HttpSettings,
    handler: Arc<dyn ConnectionHandler>,
    authenticator: Arc<dyn Authenticator>,
    quota: QuotaTracker,
    breaker: CircuitBreaker,
    admission: AdmissionQueue,
    stats: HttpStats,
    started: Instant,
}

impl HttpShared {
    fn health(&self) -> HealthResponse {
        health_check(
            self.started,
            self.admission.in_flight(),
            self.admission.queued(),
            self.breaker.snapshot(),
        )
    }
}

/// Request/response transport over `POST /mcp`.
///
/// Each request is its own short-lived connection: the handler sees
/// `on_connect`, one `on_message`, and `on_disconnect`. There is nothing to
/// address afterwards, so [`send`](Transport::send) is unsupported and
/// [`broadcast`](Transport::broadcast) reaches no one.
pub struct HttpTransport {
    shared: Arc<HttpShared>,
    host: String,
    shutdown_timeout: std::time::Duration,
    lifecycle: ListenerLifecycle,
}

impl HttpTransport {
    /// Build from the shared context and HTTP settings.
    pub fn new(context: TransportContext, settings: HttpSettings) -> Self {
        let shared = HttpShared {
            quota: QuotaTracker::new(settings.quota_limit, settings.quota_window()),
            breaker: CircuitBreaker::new(&settings.circuit_breaker),
            admission: AdmissionQueue::new(settings.max_concurrent, settings.max_queue_depth),
            stats: HttpStats::default(),
            started: Instant::now(),
            handler: context.handler,
            authenticator: context.authenticator,
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
            .route("/mcp", post(handle_mcp))
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .layer(DefaultBodyLimit::max(self.shared.settings.max_body_size))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.shared))
    }

    /// Current health body.
    pub fn health(&self) -> HealthResponse {
        self.shared.health()
    }

    /// The circuit breaker guarding admission.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    /// Running totals.
    pub fn stats(&self) -> &HttpStats {
        &self.shared.stats
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&self) -> Result<SocketAddr, TransportError> {
        let shared = Arc::clone(&self.shared);
        self.lifecycle
            .start(
                TransportKind::Http,
                &self.host,
                self.shared.settings.port,
                self.router(),
                move |token| vec![spawn_quota_sweeper(shared, token)],
            )
            .await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.lifecycle
            .stop(TransportKind::Http, self.shutdown_timeout, || async {})
            .await;
        Ok(())
    }

    async fn send(&self, _id: &ConnectionId, _message: &Message) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(TransportKind::Http))
    }

    async fn broadcast(&self, _message: &Message) -> BroadcastReport {
        BroadcastReport::default()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }
}

fn spawn_quota_sweeper(shared: Arc<HttpShared>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(shared.quota.window());
        let _ = interval.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {
                    let removed = shared.quota.sweep_expired();
                    if removed > 0 {
                        debug!(removed, remaining = shared.quota.len(), "swept expired quota records");
                    }
                }
            }
        }
    })
}

fn error_response(status: StatusCode, error: RpcError, id: Option<MessageId>) -> Response {
    (status, Json(error.into_message(id))).into_response()
}

fn quota_key(headers: &HeaderMap, header: &str, peer: SocketAddr) -> String {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| peer.ip().to_string(), str::to_string)
}

#[instrument(skip_all, fields(peer = %peer))]
async fn handle_mcp(
    State(shared): State<Arc<HttpShared>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let started = Instant::now();
    shared.stats.record_request();
    let response = admit_and_dispatch(&shared, peer, &headers, body).await;
    histogram!(HTTP_REQUEST_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    response
}

async fn admit_and_dispatch(
    shared: &Arc<HttpShared>,
    peer: SocketAddr,
    headers: &HeaderMap,
    body: String,
) -> Response {
    let settings = &shared.settings;

    let identity = match shared.authenticator.authenticate(bearer_token(headers)) {
        Ok(identity) => identity,
        Err(e) => {
            shared.stats.record_rejection(Rejection::Auth);
            debug!(error = %e, "request refused by credential gate");
            return error_response(StatusCode::UNAUTHORIZED, e.into(), extract_request_id(&body));
        }
    };

    let key = quota_key(headers, &settings.client_id_header, peer);
    let rate_limit = match shared.quota.check(&key) {
        QuotaDecision::Allowed {
            remaining,
            reset_after,
        } => RateLimitSnapshot {
            limit: settings.quota_limit,
            remaining,
            reset_after_ms: u64::try_from(reset_after.as_millis()).unwrap_or(u64::MAX),
        },
        rejected @ QuotaDecision::Rejected { .. } => {
            let retry_after_secs = rejected.retry_after_secs().unwrap_or(1);
            shared.stats.record_rejection(Rejection::Quota);
            debug!(client = %key, retry_after_secs, "quota exceeded");
            let mut response = error_response(
                StatusCode::TOO_MANY_REQUESTS,
                RpcError::QuotaExceeded { retry_after_secs },
                extract_request_id(&body),
            );
            let _ = response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
            return response;
        }
    };

    if !shared.breaker.allow_request() {
        shared.stats.record_rejection(Rejection::Circuit);
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            RpcError::CircuitOpen,
            extract_request_id(&body),
        );
    }

    // Queued requests wait until a slot frees; the reply deadline starts
    // once admitted.
    let Ok(permit) = shared.admission.acquire().await else {
        shared.stats.record_rejection(Rejection::Overload);
        warn!(
            in_flight = shared.admission.in_flight(),
            queued = shared.admission.queued(),
            "admission queue full"
        );
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Overloaded,
            extract_request_id(&body),
        );
    };
    let deadline = tokio::time::Instant::now() + settings.request_timeout();

    let raw: Arc<str> = Arc::from(body);
    let metadata = RequestMetadata {
        identity: identity.clone(),
        rate_limit: Some(rate_limit),
        ..RequestMetadata::default()
    };

    // Cancelled when the reply deadline passes or the client goes away; the
    // dispatch then observes a disconnect but is left to finish.
    let abandon = CancellationToken::new();
    let _abandon_on_drop = abandon.clone().drop_guard();
    let (tx, rx) = oneshot::channel();
    drop(tokio::spawn(run_request(
        Arc::clone(&shared.handler),
        identity,
        Arc::clone(&raw),
        metadata,
        abandon.clone(),
        move |outcome| {
            drop(permit);
            let _ = tx.send(outcome);
        },
    )));

    match tokio::time::timeout_at(deadline, rx).await {
        Ok(Ok(Ok(Some(reply)))) => {
            shared.breaker.record_status(StatusCode::OK.as_u16());
            (StatusCode::OK, Json(reply)).into_response()
        }
        Ok(Ok(Ok(None))) => {
            shared.breaker.record_status(StatusCode::ACCEPTED.as_u16());
            StatusCode::ACCEPTED.into_response()
        }
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "dispatch task failed");
            shared.breaker.record_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
            internal_error(&raw)
        }
        Ok(Err(_)) => {
            shared.breaker.record_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
            internal_error(&raw)
        }
        Err(_) => {
            abandon.cancel();
            shared.stats.record_timeout();
            shared.breaker.record_status(StatusCode::REQUEST_TIMEOUT.as_u16());
            warn!(timeout_ms = settings.request_timeout_ms, "request timed out");
            error_response(
                StatusCode::REQUEST_TIMEOUT,
                RpcError::Timeout {
                    timeout_ms: settings.request_timeout_ms,
                },
                extract_request_id(&raw),
            )
        }
    }
}

fn internal_error(raw: &str) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        RpcError::Internal {
            message: "internal error".to_string(),
        },
        extract_request_id(raw),
    )
}

/// One request as a short-lived connection.
///
/// `on_disconnect` runs once: when the dispatch finishes, or as soon as
/// `abandon` fires so the dispatcher cancels the in-flight request.
async fn run_request<F>(
    handler: Arc<dyn ConnectionHandler>,
    identity: Option<Identity>,
    raw: Arc<str>,
    metadata: RequestMetadata,
    abandon: CancellationToken,
    finish: F,
) where
    F: FnOnce(Result<Option<Message>, JoinError>) + Send + 'static,
{
    let connection_id = ConnectionId::new();
    handler
        .on_connect(
            &connection_id,
            ConnectionInfo::new(TransportKind::Http).with_identity(identity),
        )
        .await;

    let mut task = tokio::spawn({
        let handler = Arc::clone(&handler);
        let connection_id = connection_id.clone();
        async move { handler.on_message(&connection_id, &raw, metadata).await }
    });

    let outcome = tokio::select! {
        outcome = &mut task => {
            handler.on_disconnect(&connection_id).await;
            outcome
        }
        () = abandon.cancelled() => {
            handler.on_disconnect(&connection_id).await;
            task.await
        }
    };
    finish(outcome);
}

async fn handle_health(State(shared): State<Arc<HttpShared>>) -> Json<HealthResponse> {
    Json(shared.health())
}

async fn handle_metrics(State(shared): State<Arc<HttpShared>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        health: shared.health(),
        requests_total: shared.stats.requests_total(),
        rejected_total: shared.stats.rejected(),
        timeouts_total: shared.stats.timeouts_total(),
    })
}
