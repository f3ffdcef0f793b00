//! Priority-ordered middleware around method invocation.
//!
//! Each middleware receives the message, a mutable [`RequestContext`], and a
//! [`Next`] handle. Calling [`Next::run`] continues down the chain; returning
//! without calling it short-circuits with the returned result or error.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::Message;
use serde_json::Value;
use tracing::debug;

use crate::context::RequestContext;
use crate::errors::RpcError;

/// Request interception hook.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Higher priority runs earlier (further from the handler). Default: 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Handle the message, usually by calling `next.run(message, ctx)`.
    async fn handle(
        &self,
        message: &Message,
        ctx: &mut RequestContext,
        next: Next<'_>,
    ) -> Result<Value, RpcError>;
}

/// The innermost step of the chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Invoke the method the message names.
    async fn call(&self, message: &Message, ctx: &mut RequestContext) -> Result<Value, RpcError>;
}

/// Remainder of the chain from a middleware's point of view.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl Next<'_> {
    /// Run the rest of the chain.
    pub async fn run(self, message: &Message, ctx: &mut RequestContext) -> Result<Value, RpcError> {
        match self.rest.split_first() {
            Some((head, tail)) => {
                let next = Next {
                    rest: tail,
                    endpoint: self.endpoint,
                };
                head.handle(message, ctx, next).await
            }
            None => self.endpoint.call(message, ctx).await,
        }
    }
}

/// Ordered middleware list.
#[derive(Default)]
pub struct MiddlewareChain {
    entries: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a middleware. The sort is stable, so equal priorities keep
    /// registration order.
    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        debug!(name = %middleware.name(), priority = middleware.priority(), "registering middleware");
        self.entries.push(middleware);
        self.entries.sort_by_key(|m| std::cmp::Reverse(m.priority()));
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|m| m.name()).collect()
    }

    /// Number of middleware.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the chain with `endpoint` as the innermost step.
    pub async fn run(
        &self,
        message: &Message,
        ctx: &mut RequestContext,
        endpoint: &dyn Endpoint,
    ) -> Result<Value, RpcError> {
        Next {
            rest: &self.entries,
            endpoint,
        }
        .run(message, ctx)
        .await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("entries", &self.names())
            .finish()
    }
}
