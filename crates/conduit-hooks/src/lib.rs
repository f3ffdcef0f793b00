//! # conduit-hooks
//!
//! Observational lifecycle hooks for Conduit connections and dispatch.
//!
//! Hooks fire at fixed points:
//! [`Connect`](types::HookPhase::Connect) /
//! [`Disconnect`](types::HookPhase::Disconnect) around a connection,
//! [`Request`](types::HookPhase::Request) before the middleware chain,
//! [`BeforeInvoke`](types::HookPhase::BeforeInvoke) /
//! [`AfterInvoke`](types::HookPhase::AfterInvoke) around the method call, and
//! [`Response`](types::HookPhase::Response) /
//! [`Error`](types::HookPhase::Error) on the outcome.
//!
//! ## Fail-Open
//!
//! A hook cannot change the outcome of a request. Errors and timeouts are
//! logged at `warn` and the remaining hooks still run.

#![deny(unsafe_code)]

pub mod engine;
pub mod errors;
pub mod handler;
pub mod registry;
pub mod types;

pub use engine::{FireReport, HookEngine};
pub use errors::HookError;
pub use handler::HookHandler;
pub use registry::HookRegistry;
pub use types::{HookContext, HookPhase};
