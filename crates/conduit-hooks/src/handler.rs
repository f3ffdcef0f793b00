//! Hook handler trait.

use async_trait::async_trait;

use crate::errors::HookError;
use crate::types::{HookContext, HookPhase};

/// A lifecycle hook handler.
///
/// Higher priority handlers run first; ties keep registration order.
/// Errors are caught by the [`HookEngine`](crate::engine::HookEngine) and
/// never reach the request.
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Unique name for this handler.
    fn name(&self) -> &str;

    /// Phase this handler responds to.
    fn phase(&self) -> HookPhase;

    /// Execution priority. Higher runs first. Default: 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Optional timeout in milliseconds. The engine applies a default when
    /// `None`.
    fn timeout_ms(&self) -> Option<u64> {
        None
    }

    /// Run the hook.
    async fn handle(&self, context: &HookContext) -> Result<(), HookError>;

    /// Return `false` to skip this handler for the context.
    fn should_handle(&self, _context: &HookContext) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{ConnectionId, TransportKind};

    struct Noop;

    #[async_trait]
    impl HookHandler for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn phase(&self) -> HookPhase {
            HookPhase::Connect
        }
        async fn handle(&self, _context: &HookContext) -> Result<(), HookError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn defaults() {
        let h = Noop;
        let ctx = HookContext::new(HookPhase::Connect, ConnectionId::new(), TransportKind::WebSocket);
        assert_eq!(h.priority(), 0);
        assert!(h.timeout_ms().is_none());
        assert!(h.should_handle(&ctx));
        assert!(h.handle(&ctx).await.is_ok());
    }
}
