//! Persistent bidirectional socket transport.
//!
//! Each connection moves through `Connecting → Open → Closing → Closed`.
//! Whatever ends it (peer close, read error, heartbeat, idle timeout, size
//! cap, or `stop()`), the session funnels into one cleanup that runs
//! exactly once and calls `on_disconnect`.

pub mod connection;
pub mod heartbeat;
mod registry;
mod session;
mod transport;

pub use connection::{ClientConnection, CloseReason, ConnectionState};
pub use transport::WebSocketTransport;
