//! # conduit-server
//!
//! Transports and the resilience layer in front of the dispatch pipeline.
//!
//! - [`websocket`]: persistent bidirectional sockets with heartbeat, idle
//!   timeout, per-connection rate limiting, and outbound backpressure
//! - [`http`]: one message per `POST`, behind credential, quota, circuit
//!   breaker, and concurrency admission
//! - [`streaming`]: newline-delimited JSON over a long-lived chunked request
//!   and response pair
//!
//! Every transport implements [`Transport`] and feeds a shared
//! [`ConnectionHandler`](conduit_rpc::ConnectionHandler), normally the
//! [`Dispatcher`](conduit_rpc::Dispatcher). [`ConduitServer`] composes the
//! enabled transports from settings.

#![deny(unsafe_code)]

pub mod auth;
pub(crate) mod dispatch;
pub mod health;
pub mod http;
pub mod metrics;
pub mod resilience;
pub mod server;
pub mod shutdown;
pub mod streaming;
pub mod transport;
pub mod websocket;

pub use auth::{AuthError, Authenticator, StaticTokenAuthenticator};
pub use http::HttpTransport;
pub use server::ConduitServer;
pub use shutdown::ShutdownCoordinator;
pub use streaming::StreamingTransport;
pub use transport::{BroadcastReport, Transport, TransportContext, TransportError};
pub use websocket::WebSocketTransport;
