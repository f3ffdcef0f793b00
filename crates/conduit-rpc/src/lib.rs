//! # conduit-rpc
//!
//! The dispatch pipeline every transport feeds.
//!
//! A transport hands raw inbound text to a [`ConnectionHandler`]. The
//! [`Dispatcher`] parses it, runs the [`MiddlewareChain`], invokes the
//! method through a [`ToolRegistry`] under a deadline, fires lifecycle hooks
//! around each step, and normalizes whatever happened into exactly one wire
//! [`Message`](conduit_core::Message) (or nothing, for events).

#![deny(unsafe_code)]

pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod metrics;
pub mod middleware;
pub mod registry;

pub use context::{ConnectionInfo, Identity, RateLimitSnapshot, RequestContext, RequestMetadata};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use errors::RpcError;
pub use handler::ConnectionHandler;
pub use middleware::{Endpoint, Middleware, MiddlewareChain, Next};
pub use registry::{MethodHandler, MethodRegistry, ToolRegistry};
