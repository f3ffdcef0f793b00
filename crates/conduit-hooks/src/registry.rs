//! Hook registry.
//!
//! Holds the [`HookHandler`]s per [`HookPhase`], sorted by priority
//! (descending). Registration happens before the server starts.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::handler::HookHandler;
use crate::types::HookPhase;

/// Registry of lifecycle hook handlers.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<HookPhase, Vec<Arc<dyn HookHandler>>>,
}

impl HookRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
        }
    }

    /// Register a hook handler. Registration only appends; the sort is
    /// stable, so equal priorities run in registration order.
    pub fn register(&mut self, handler: Arc<dyn HookHandler>) {
        let phase = handler.phase();
        debug!(name = handler.name(), phase = %phase, priority = handler.priority(), "registering hook");

        let handlers = self.hooks.entry(phase).or_default();
        handlers.push(handler);
        handlers.sort_by_key(|h| std::cmp::Reverse(h.priority()));
    }

    /// Handlers for a phase, highest priority first.
    #[must_use]
    pub fn get_handlers(&self, phase: HookPhase) -> &[Arc<dyn HookHandler>] {
        self.hooks.get(&phase).map_or(&[], Vec::as_slice)
    }

    /// Total number of registered handlers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hook_count", &self.count())
            .finish()
    }
}
