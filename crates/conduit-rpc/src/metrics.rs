//! Dispatch metric names.

/// Messages handed to the dispatcher, labelled by `kind`.
pub const DISPATCH_MESSAGES_TOTAL: &str = "dispatch_messages_total";
/// Failed dispatches, labelled by `class`.
pub const DISPATCH_ERRORS_TOTAL: &str = "dispatch_errors_total";
/// Method invocation latency, labelled by `method`.
pub const DISPATCH_DURATION_SECONDS: &str = "dispatch_duration_seconds";
/// Invocations that hit the handler deadline.
pub const DISPATCH_TIMEOUTS_TOTAL: &str = "dispatch_timeouts_total";
