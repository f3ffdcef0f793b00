//! Hook error types.

use thiserror::Error;

/// Errors a hook can produce. The engine logs them and moves on.
#[derive(Debug, Error)]
pub enum HookError {
    /// Hook execution timed out.
    #[error("hook timed out after {timeout_ms}ms: {name}")]
    Timeout {
        /// Hook name that timed out.
        name: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Hook handler returned an error.
    #[error("hook handler error in '{name}': {message}")]
    HandlerError {
        /// Hook name.
        name: String,
        /// Error message from handler.
        message: String,
    },

    /// Generic internal error.
    #[error("{0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_name() {
        let err = HookError::Timeout {
            name: "audit".into(),
            timeout_ms: 50,
        };
        assert_eq!(err.to_string(), "hook timed out after 50ms: audit");

        let err = HookError::HandlerError {
            name: "audit".into(),
            message: "disk full".into(),
        };
        assert!(err.to_string().contains("disk full"));
    }
}
