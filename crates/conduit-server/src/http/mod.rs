//! Request/response transport: one message per `POST /mcp`.
//!
//! Every request is admitted in a fixed order, each step short-circuiting
//! the rest: credential (401), per-client quota (429), circuit breaker
//! (503), then concurrency admission (503 when the wait queue is full).
//! The admitted request is dispatched in its own task and raced against
//! the request timeout (408).

mod stats;
mod transport;

pub use stats::HttpStats;
pub use transport::HttpTransport;
