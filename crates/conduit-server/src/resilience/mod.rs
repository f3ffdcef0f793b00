//! Admission and failure-isolation primitives used by the transports.
//!
//! All of them read time through `tokio::time::Instant`, so tests can drive
//! them with a paused clock.

pub mod admission;
pub mod circuit_breaker;
pub mod quota;
pub mod rate_limit;

mod window;

pub use admission::{AdmissionPermit, AdmissionQueue};
pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use quota::{QuotaDecision, QuotaTracker};
pub use rate_limit::MessageRateLimiter;
