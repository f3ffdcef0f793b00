//! # conduit-core
//!
//! Foundation types shared by every Conduit crate.
//!
//! - **Branded IDs**: [`ConnectionId`](ids::ConnectionId) and
//!   [`SessionId`](ids::SessionId) as newtypes so they cannot be mixed up
//! - **Messages**: the four-variant wire [`Message`](messages::Message) model
//! - **Errors**: reserved wire error codes and the [`FailureClass`](errors::FailureClass) taxonomy
//! - **Transports**: the [`TransportKind`](transport::TransportKind) label
//! - **Logging**: [`init_subscriber`](logging::init_subscriber) for the global `tracing` subscriber

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod transport;

pub use errors::FailureClass;
pub use ids::{ConnectionId, SessionId};
pub use messages::{ErrorBody, Message, MessageId};
pub use transport::TransportKind;
