//! Hook execution engine.
//!
//! Runs every handler registered for a phase, in priority order, each under
//! its own timeout. Errors and timeouts are logged and skipped (fail-open).

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::handler::HookHandler;
use crate::registry::HookRegistry;
use crate::types::{HookContext, HookPhase};

/// Timeout for handlers that don't declare one.
pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 5_000;

/// Outcome of firing one phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FireReport {
    /// Handlers that ran to completion without error.
    pub succeeded: usize,
    /// Handlers that errored or timed out.
    pub failed: usize,
    /// Handlers skipped by their `should_handle` filter.
    pub skipped: usize,
}

/// Hook execution engine.
///
/// Owns the [`HookRegistry`]. The registry is fixed once the engine is built.
#[derive(Debug, Default)]
pub struct HookEngine {
    registry: HookRegistry,
}

impl HookEngine {
    /// Create an engine over a populated registry.
    #[must_use]
    pub fn new(registry: HookRegistry) -> Self {
        Self { registry }
    }

    /// Whether any handler is registered for `phase`.
    #[must_use]
    pub fn has_handlers(&self, phase: HookPhase) -> bool {
        !self.registry.get_handlers(phase).is_empty()
    }

    /// Registered handler count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Fire every handler for `context.phase`, sequentially.
    pub async fn fire(&self, context: &HookContext) -> FireReport {
        let handlers = self.registry.get_handlers(context.phase);
        let mut report = FireReport::default();
        if handlers.is_empty() {
            return report;
        }

        let start = Instant::now();
        for handler in handlers {
            if !handler.should_handle(context) {
                report.skipped += 1;
                continue;
            }
            if run_single(handler.as_ref(), context).await {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        debug!(
            phase = %context.phase,
            connection_id = %context.connection_id,
            duration_ms = start.elapsed().as_millis(),
            failed = report.failed,
            "hooks fired"
        );
        report
    }
}

async fn run_single(handler: &dyn HookHandler, context: &HookContext) -> bool {
    let timeout_ms = handler.timeout_ms().unwrap_or(DEFAULT_HOOK_TIMEOUT_MS);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), handler.handle(context)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(name = %handler.name(), phase = %context.phase, error = %e, "hook handler error (fail-open)");
            false
        }
        Err(_) => {
            warn!(name = %handler.name(), phase = %context.phase, timeout_ms, "hook handler timed out (fail-open)");
            false
        }
    }
}
