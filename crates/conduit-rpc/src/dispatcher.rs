//! Message dispatch: parse, middleware, invoke, hooks, normalize.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_core::{ConnectionId, Message};
use conduit_hooks::{HookContext, HookEngine, HookHandler, HookPhase, HookRegistry};
use conduit_settings::DispatchSettings;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::context::{ConnectionInfo, RequestContext, RequestMetadata};
use crate::errors::{RpcError, id_from_value, normalize};
use crate::handler::ConnectionHandler;
use crate::metrics::{
    DISPATCH_DURATION_SECONDS, DISPATCH_ERRORS_TOTAL, DISPATCH_MESSAGES_TOTAL,
    DISPATCH_TIMEOUTS_TOTAL,
};
use crate::middleware::{Endpoint, Middleware, MiddlewareChain};
use crate::registry::ToolRegistry;

struct ConnectionEntry {
    info: ConnectionInfo,
    cancel: CancellationToken,
}

/// Shared dispatcher behind every transport.
///
/// Holds the per-connection bookkeeping it needs for hooks and cancellation;
/// the connections themselves are owned by their transports.
pub struct Dispatcher {
    registry: Arc<dyn ToolRegistry>,
    middleware: MiddlewareChain,
    hooks: HookEngine,
    handler_timeout: Duration,
    slow_request: Duration,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

/// Builder for [`Dispatcher`]. Middleware and hooks are fixed at `build()`.
pub struct DispatcherBuilder {
    registry: Arc<dyn ToolRegistry>,
    middleware: MiddlewareChain,
    hooks: HookRegistry,
    handler_timeout: Duration,
    slow_request: Duration,
}

impl DispatcherBuilder {
    /// Start from a method catalog with default deadlines.
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        let defaults = DispatchSettings::default();
        Self {
            registry,
            middleware: MiddlewareChain::new(),
            hooks: HookRegistry::new(),
            handler_timeout: defaults.handler_timeout(),
            slow_request: defaults.slow_request(),
        }
    }

    /// Apply dispatch settings.
    #[must_use]
    pub fn settings(mut self, settings: &DispatchSettings) -> Self {
        self.handler_timeout = settings.handler_timeout();
        self.slow_request = settings.slow_request();
        self
    }

    /// Override the per-call handler deadline.
    #[must_use]
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Add a middleware.
    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.add(middleware);
        self
    }

    /// Add a lifecycle hook.
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn HookHandler>) -> Self {
        self.hooks.register(hook);
        self
    }

    /// Finish.
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            registry: self.registry,
            middleware: self.middleware,
            hooks: HookEngine::new(self.hooks),
            handler_timeout: self.handler_timeout,
            slow_request: self.slow_request,
            connections: RwLock::new(HashMap::new()),
        }
    }
}

impl Dispatcher {
    /// Builder over `registry`.
    pub fn builder(registry: Arc<dyn ToolRegistry>) -> DispatcherBuilder {
        DispatcherBuilder::new(registry)
    }

    /// Connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether `id` is registered.
    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    /// Per-call handler deadline.
    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    fn lookup(&self, id: &ConnectionId) -> Option<(ConnectionInfo, CancellationToken)> {
        self.connections
            .read()
            .get(id)
            .map(|e| (e.info.clone(), e.cancel.clone()))
    }

    async fn fire(&self, context: HookContext) {
        if self.hooks.has_handlers(context.phase) {
            let _ = self.hooks.fire(&context).await;
        }
    }
}

#[async_trait]
impl ConnectionHandler for Dispatcher {
    async fn on_connect(&self, id: &ConnectionId, info: ConnectionInfo) {
        let kind = info.kind;
        let previous = {
            let mut connections = self.connections.write();
            connections.insert(
                id.clone(),
                ConnectionEntry {
                    info,
                    cancel: CancellationToken::new(),
                },
            )
        };
        if let Some(previous) = previous {
            warn!(connection_id = %id, "connection registered twice, replacing");
            previous.cancel.cancel();
        }
        debug!(connection_id = %id, transport = %kind, "dispatcher: connection registered");
        self.fire(HookContext::new(HookPhase::Connect, id.clone(), kind))
            .await;
    }

    async fn on_disconnect(&self, id: &ConnectionId) {
        let removed = { self.connections.write().remove(id) };
        let Some(entry) = removed else {
            return;
        };
        entry.cancel.cancel();
        debug!(connection_id = %id, "dispatcher: connection removed");
        self.fire(HookContext::new(HookPhase::Disconnect, id.clone(), entry.info.kind))
            .await;
    }

    async fn on_message(
        &self,
        id: &ConnectionId,
        raw: &str,
        metadata: RequestMetadata,
    ) -> Option<Message> {
        let received_at = Instant::now();

        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                counter!(DISPATCH_ERRORS_TOTAL, "class" => "protocol").increment(1);
                debug!(connection_id = %id, error = %e, "unparseable message");
                return Some(RpcError::Parse { message: e.to_string() }.into_message(None));
            }
        };
        let fallback_id = id_from_value(&value);
        let message: Message = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                counter!(DISPATCH_ERRORS_TOTAL, "class" => "protocol").increment(1);
                debug!(connection_id = %id, error = %e, "malformed message");
                return Some(
                    RpcError::InvalidRequest { message: e.to_string() }.into_message(fallback_id),
                );
            }
        };

        counter!(DISPATCH_MESSAGES_TOTAL, "kind" => message.kind()).increment(1);
        let (message_id, method) = match &message {
            Message::Request { id, method, .. } => (Some(id.clone()), method.clone()),
            Message::Event { method, .. } => (None, method.clone()),
            Message::Response { .. } | Message::Error { .. } => {
                warn!(connection_id = %id, kind = message.kind(), "dropping client-sent reply");
                return None;
            }
        };

        let Some((info, connection_cancel)) = self.lookup(id) else {
            warn!(connection_id = %id, method = %method, "message for unregistered connection");
            return message_id.map(|mid| {
                RpcError::InvalidRequest {
                    message: "connection not registered".into(),
                }
                .into_message(Some(mid))
            });
        };

        let span = info_span!(
            "dispatch",
            connection_id = %id,
            transport = %info.kind,
            method = %method,
            request_id = ?message_id,
        );
        let mut ctx = RequestContext {
            connection_id: id.clone(),
            transport: info.kind,
            message_id: message_id.clone(),
            method: method.clone(),
            metadata,
            span: span.clone(),
            cancel: connection_cancel.child_token(),
            received_at,
        };
        if ctx.metadata.identity.is_none() {
            ctx.metadata.identity = info.identity;
        }

        let hook_base = HookContext::new(HookPhase::Request, id.clone(), info.kind)
            .with_method(Some(&method))
            .with_message_id(message_id.clone());
        self.fire(hook_base.clone()).await;

        let endpoint = Invoke {
            registry: self.registry.as_ref(),
            hooks: &self.hooks,
            timeout: self.handler_timeout,
            hook_base: &hook_base,
        };
        let outcome = self
            .middleware
            .run(&message, &mut ctx, &endpoint)
            .instrument(span.clone())
            .await;

        let elapsed = received_at.elapsed();
        let elapsed_ms = duration_ms(elapsed);
        match &outcome {
            Ok(_) => {
                self.fire(hook_base.for_phase(HookPhase::Response).with_duration_ms(elapsed_ms))
                    .await;
            }
            Err(e) => {
                counter!(DISPATCH_ERRORS_TOTAL, "class" => e.class().to_string()).increment(1);
                self.fire(
                    hook_base
                        .for_phase(HookPhase::Error)
                        .with_duration_ms(elapsed_ms)
                        .with_error(e.to_error_body()),
                )
                .await;
            }
        }
        if elapsed >= self.slow_request {
            warn!(parent: &span, duration_ms = elapsed_ms, "slow request");
        }

        match message_id {
            Some(mid) => Some(normalize(mid, outcome)),
            None => {
                if let Err(e) = outcome {
                    warn!(parent: &span, error = %e, class = %e.class(), "event handling failed");
                }
                None
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("middleware", &self.middleware)
            .field("hooks", &self.hooks.count())
            .field("handler_timeout", &self.handler_timeout)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

/// Innermost chain step: hooks around a deadline-bounded registry call.
struct Invoke<'a> {
    registry: &'a dyn ToolRegistry,
    hooks: &'a HookEngine,
    timeout: Duration,
    hook_base: &'a HookContext,
}

impl Invoke<'_> {
    async fn fire(&self, context: HookContext) {
        if self.hooks.has_handlers(context.phase) {
            let _ = self.hooks.fire(&context).await;
        }
    }
}

#[async_trait]
impl Endpoint for Invoke<'_> {
    async fn call(&self, message: &Message, ctx: &mut RequestContext) -> Result<Value, RpcError> {
        let params = match message {
            Message::Request { params, .. } | Message::Event { params, .. } => params.clone(),
            Message::Response { .. } | Message::Error { .. } => None,
        };

        self.fire(self.hook_base.for_phase(HookPhase::BeforeInvoke)).await;

        let start = Instant::now();
        let ctx: &RequestContext = ctx;
        let outcome =
            match tokio::time::timeout(self.timeout, self.registry.invoke(&ctx.method, params, ctx))
                .await
            {
                Ok(result) => result,
                Err(_elapsed) => {
                    // The handler future is dropped here; anything it spawned
                    // sees the cancelled token.
                    ctx.cancel.cancel();
                    let timeout_ms = duration_ms(self.timeout);
                    counter!(DISPATCH_TIMEOUTS_TOTAL).increment(1);
                    warn!(method = %ctx.method, timeout_ms, "handler timed out");
                    Err(RpcError::Timeout { timeout_ms })
                }
            };
        let elapsed = start.elapsed();
        histogram!(DISPATCH_DURATION_SECONDS, "method" => ctx.method.clone())
            .record(elapsed.as_secs_f64());

        let mut after = self
            .hook_base
            .for_phase(HookPhase::AfterInvoke)
            .with_duration_ms(duration_ms(elapsed));
        if let Err(e) = &outcome {
            after = after.with_error(e.to_error_body());
        }
        self.fire(after).await;

        outcome
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use conduit_core::errors::codes;
    use conduit_core::{MessageId, TransportKind};
    use conduit_hooks::HookError;
    use serde_json::json;

    use super::*;
    use crate::context::Identity;
    use crate::middleware::Next;
    use crate::registry::{MethodHandler, MethodRegistry};

    struct Ping;

    #[async_trait]
    impl MethodHandler for Ping {
        async fn handle(&self, _: Option<Value>, _: &RequestContext) -> Result<Value, RpcError> {
            Ok(json!("pong"))
        }
    }

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl MethodHandler for Count {
        async fn handle(&self, _: Option<Value>, _: &RequestContext) -> Result<Value, RpcError> {
            let _ = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    struct WhoAmI;

    #[async_trait]
    impl MethodHandler for WhoAmI {
        async fn handle(&self, _: Option<Value>, ctx: &RequestContext) -> Result<Value, RpcError> {
            Ok(serde_json::to_value(&ctx.metadata.identity)?)
        }
    }

    /// Ignores the deadline but spawns a watcher on the token.
    struct Stubborn(Arc<AtomicBool>);

    #[async_trait]
    impl MethodHandler for Stubborn {
        async fn handle(&self, _: Option<Value>, ctx: &RequestContext) -> Result<Value, RpcError> {
            let token = ctx.cancel.clone();
            let flag = Arc::clone(&self.0);
            drop(tokio::spawn(async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            }));
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    struct Deny;

    #[async_trait]
    impl Middleware for Deny {
        fn name(&self) -> &str {
            "deny"
        }
        async fn handle(&self, _: &Message, _: &mut RequestContext, _: Next<'_>) -> Result<Value, RpcError> {
            Err(RpcError::Unauthorized {
                message: "denied".into(),
            })
        }
    }

    struct PhaseLog {
        phase: HookPhase,
        log: Arc<Mutex<Vec<HookPhase>>>,
        fail: bool,
    }

    #[async_trait]
    impl HookHandler for PhaseLog {
        fn name(&self) -> &str {
            "phase-log"
        }
        fn phase(&self) -> HookPhase {
            self.phase
        }
        async fn handle(&self, context: &HookContext) -> Result<(), HookError> {
            self.log.lock().unwrap().push(context.phase);
            if self.fail {
                return Err(HookError::Internal("hook failure".into()));
            }
            Ok(())
        }
    }

    fn registry() -> MethodRegistry {
        let mut reg = MethodRegistry::new();
        reg.register("ping", Ping);
        reg.register("whoami", WhoAmI);
        reg
    }

    async fn connected(dispatcher: &Dispatcher) -> ConnectionId {
        let id = ConnectionId::new();
        dispatcher
            .on_connect(&id, ConnectionInfo::new(TransportKind::WebSocket))
            .await;
        id
    }

    fn error_code(reply: &Message) -> i32 {
        match reply {
            Message::Error { error, .. } => error.code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_gets_response() {
        let d = Dispatcher::builder(Arc::new(registry())).build();
        let id = connected(&d).await;
        let reply = d
            .on_message(&id, r#"{"type":"request","id":1,"method":"ping"}"#, RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(reply, Message::response(MessageId::Number(1), json!("pong")));
    }

    #[tokio::test]
    async fn parse_error_has_null_id() {
        let d = Dispatcher::builder(Arc::new(registry())).build();
        let id = connected(&d).await;
        let reply = d.on_message(&id, "{not json", RequestMetadata::default()).await.unwrap();
        assert_eq!(error_code(&reply), codes::PARSE_ERROR);
        assert!(reply.id().is_none());
        let wire = serde_json::to_value(&reply).unwrap();
        assert!(wire["id"].is_null());
    }

    #[tokio::test]
    async fn wrong_shape_is_invalid_request_with_id() {
        let d = Dispatcher::builder(Arc::new(registry())).build();
        let id = connected(&d).await;
        let reply = d
            .on_message(&id, r#"{"type":"request","id":"abc"}"#, RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(error_code(&reply), codes::INVALID_REQUEST);
        assert_eq!(reply.id(), Some(&MessageId::from("abc")));
    }

    #[tokio::test]
    async fn unknown_method() {
        let d = Dispatcher::builder(Arc::new(registry())).build();
        let id = connected(&d).await;
        let reply = d
            .on_message(&id, r#"{"type":"request","id":2,"method":"nope"}"#, RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(error_code(&reply), codes::METHOD_NOT_FOUND);
        assert_eq!(reply.id(), Some(&MessageId::Number(2)));
    }

    #[tokio::test]
    async fn events_get_no_reply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = MethodRegistry::new();
        reg.register("notify", Count(Arc::clone(&calls)));
        let d = Dispatcher::builder(Arc::new(reg)).build();
        let id = connected(&d).await;

        let reply = d
            .on_message(&id, r#"{"type":"event","method":"notify"}"#, RequestMetadata::default())
            .await;
        assert!(reply.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let reply = d
            .on_message(&id, r#"{"type":"event","method":"missing"}"#, RequestMetadata::default())
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn client_replies_are_dropped() {
        let d = Dispatcher::builder(Arc::new(registry())).build();
        let id = connected(&d).await;
        let raw = r#"{"type":"response","id":1,"result":true}"#;
        assert!(d.on_message(&id, raw, RequestMetadata::default()).await.is_none());
        let raw = r#"{"type":"error","id":null,"error":{"code":-1,"message":"x"}}"#;
        assert!(d.on_message(&id, raw, RequestMetadata::default()).await.is_none());
    }

    #[tokio::test]
    async fn unregistered_connection_is_rejected() {
        let d = Dispatcher::builder(Arc::new(registry())).build();
        let reply = d
            .on_message(
                &ConnectionId::new(),
                r#"{"type":"request","id":3,"method":"ping"}"#,
                RequestMetadata::default(),
            )
            .await
            .unwrap();
        assert_eq!(error_code(&reply), codes::INVALID_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_token_and_reports() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut reg = MethodRegistry::new();
        reg.register("slow", Stubborn(Arc::clone(&cancelled)));
        let d = Dispatcher::builder(Arc::new(reg))
            .handler_timeout(Duration::from_secs(1))
            .build();
        let id = connected(&d).await;

        let reply = d
            .on_message(&id, r#"{"type":"request","id":9,"method":"slow"}"#, RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(error_code(&reply), codes::REQUEST_TIMEOUT);
        assert_eq!(reply.id(), Some(&MessageId::Number(9)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn middleware_short_circuit_becomes_error_reply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut reg = MethodRegistry::new();
        reg.register("count", Count(Arc::clone(&calls)));
        let d = Dispatcher::builder(Arc::new(reg))
            .middleware(Arc::new(Deny))
            .build();
        let id = connected(&d).await;

        let reply = d
            .on_message(&id, r#"{"type":"request","id":4,"method":"count"}"#, RequestMetadata::default())
            .await
            .unwrap();
        assert_eq!(error_code(&reply), codes::UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hooks_fire_in_order_and_fail_open() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = Dispatcher::builder(Arc::new(registry()));
        for phase in HookPhase::all() {
            builder = builder.hook(Arc::new(PhaseLog {
                phase: *phase,
                log: Arc::clone(&log),
                fail: true,
            }));
        }
        let d = builder.build();
        let id = connected(&d).await;

        let reply = d
            .on_message(&id, r#"{"type":"request","id":1,"method":"ping"}"#, RequestMetadata::default())
            .await
            .unwrap();
        assert!(!reply.is_error());

        d.on_disconnect(&id).await;
        assert_eq!(
            *log.lock().unwrap(),
            [
                HookPhase::Connect,
                HookPhase::Request,
                HookPhase::BeforeInvoke,
                HookPhase::AfterInvoke,
                HookPhase::Response,
                HookPhase::Disconnect,
            ]
        );
    }

    #[tokio::test]
    async fn connection_identity_reaches_handler() {
        let d = Dispatcher::builder(Arc::new(registry())).build();
        let id = ConnectionId::new();
        d.on_connect(
            &id,
            ConnectionInfo::new(TransportKind::Http).with_identity(Some(Identity::bearer("ops"))),
        )
        .await;

        let reply = d
            .on_message(&id, r#"{"type":"request","id":1,"method":"whoami"}"#, RequestMetadata::default())
            .await
            .unwrap();
        match reply {
            Message::Response { result, .. } => assert_eq!(result["subject"], "ops"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_tracked() {
        let d = Dispatcher::builder(Arc::new(registry())).build();
        let id = connected(&d).await;
        assert!(d.is_connected(&id));
        assert_eq!(d.connection_count(), 1);
        d.on_disconnect(&id).await;
        d.on_disconnect(&id).await;
        assert_eq!(d.connection_count(), 0);
    }
}
