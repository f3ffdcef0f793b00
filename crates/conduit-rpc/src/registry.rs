//! Method catalog seam and the default name → handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::RequestContext;
use crate::errors::RpcError;

/// The protocol method catalog as seen by the dispatcher.
///
/// Given a method name and arguments, produce a result or a typed failure.
/// Long-running implementations should watch `ctx.cancel`.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Invoke `method` with `params`.
    async fn invoke(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<Value, RpcError>;
}

/// A single method implementation.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params and context.
    async fn handle(&self, params: Option<Value>, ctx: &RequestContext) -> Result<Value, RpcError>;
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method name, replacing any previous one.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// List all registered method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

#[async_trait]
impl ToolRegistry for MethodRegistry {
    async fn invoke(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &RequestContext,
    ) -> Result<Value, RpcError> {
        let Some(handler) = self.handlers.get(method) else {
            return Err(RpcError::MethodNotFound {
                method: method.to_owned(),
            });
        };
        handler.handle(params, ctx).await
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use conduit_core::{ConnectionId, TransportKind};
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl MethodHandler for EchoHandler {
        async fn handle(&self, params: Option<Value>, _ctx: &RequestContext) -> Result<Value, RpcError> {
            Ok(params.unwrap_or(Value::Null))
        }
    }

    struct GreetHandler;

    #[async_trait]
    impl MethodHandler for GreetHandler {
        async fn handle(&self, params: Option<Value>, _ctx: &RequestContext) -> Result<Value, RpcError> {
            let p = params.ok_or_else(|| RpcError::InvalidParams {
                message: "params required".into(),
            })?;
            let name = p.get("name").and_then(Value::as_str).ok_or_else(|| RpcError::InvalidParams {
                message: "Missing 'name'".into(),
            })?;
            Ok(json!({ "hello": name }))
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(ConnectionId::new(), TransportKind::Http, None, "test")
    }

    #[tokio::test]
    async fn invoke_registered() {
        let mut reg = MethodRegistry::new();
        reg.register("echo", EchoHandler);
        let out = reg.invoke("echo", Some(json!({"x": 1})), &ctx()).await.unwrap();
        assert_eq!(out["x"], 1);
    }

    #[tokio::test]
    async fn invoke_unknown_is_method_not_found() {
        let reg = MethodRegistry::new();
        let err = reg.invoke("nope", None, &ctx()).await.unwrap_err();
        assert_matches!(err, RpcError::MethodNotFound { method } if method == "nope");
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let mut reg = MethodRegistry::new();
        reg.register("greet", GreetHandler);
        let err = reg.invoke("greet", Some(json!({})), &ctx()).await.unwrap_err();
        assert_matches!(err, RpcError::InvalidParams { .. });
    }

    #[test]
    fn methods_sorted() {
        let mut reg = MethodRegistry::new();
        reg.register("zeta", EchoHandler);
        reg.register("alpha", EchoHandler);
        assert_eq!(reg.methods(), ["alpha", "zeta"]);
        assert!(reg.has_method("alpha"));
        assert!(!reg.has_method("beta"));
    }
}
