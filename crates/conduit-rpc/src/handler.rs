//! The seam between transports and the dispatch pipeline.

use async_trait::async_trait;
use conduit_core::{ConnectionId, Message};

use crate::context::{ConnectionInfo, RequestMetadata};

/// Receives connection lifecycle and inbound traffic from a transport.
///
/// Transports pass raw text through uninspected and deliver any returned
/// reply over their own send path. `on_disconnect` is called exactly once
/// per connection that saw `on_connect`.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// A connection was admitted.
    async fn on_connect(&self, id: &ConnectionId, info: ConnectionInfo);

    /// A connection was cleaned up.
    async fn on_disconnect(&self, id: &ConnectionId);

    /// One inbound message. `metadata` carries what the transport learned
    /// while admitting it (e.g. a rate-limit snapshot).
    async fn on_message(
        &self,
        id: &ConnectionId,
        raw: &str,
        metadata: RequestMetadata,
    ) -> Option<Message>;
}
