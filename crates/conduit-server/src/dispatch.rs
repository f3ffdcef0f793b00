//! Ordered dispatch shared by the connection-oriented transports.
//!
//! Each connection gets one dispatch loop. The reader queues raw messages
//! in arrival order and the loop enters `on_message` for them in that same
//! order. Handlers then run concurrently on the loop's task, so replies may
//! complete out of order and are correlated by message id.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use conduit_core::{ConnectionId, Message};
use conduit_rpc::errors::extract_request_id;
use conduit_rpc::{ConnectionHandler, RequestMetadata, RpcError};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// A raw inbound message plus the metadata the transport seeds it with.
struct Inbound {
    raw: Arc<str>,
    metadata: RequestMetadata,
}

/// Sending half of a connection's dispatch loop.
///
/// Dropping every queue lets the loop finish the messages already handed
/// over and then exit.
#[derive(Clone)]
pub(crate) struct DispatchQueue {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl DispatchQueue {
    /// Spawn the dispatch loop for `connection_id`. Every reply is passed
    /// to `deliver`.
    pub(crate) fn spawn<F, Fut>(
        handler: Arc<dyn ConnectionHandler>,
        connection_id: ConnectionId,
        deliver: F,
    ) -> (Self, JoinHandle<()>)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_dispatch_loop(handler, connection_id, rx, deliver));
        (Self { tx }, task)
    }

    /// Queue a message behind everything already handed over. Returns
    /// `false` once the loop is gone.
    pub(crate) fn push(&self, raw: impl Into<Arc<str>>, metadata: RequestMetadata) -> bool {
        self.tx
            .send(Inbound {
                raw: raw.into(),
                metadata,
            })
            .is_ok()
    }
}

async fn run_dispatch_loop<F, Fut>(
    handler: Arc<dyn ConnectionHandler>,
    connection_id: ConnectionId,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    deliver: F,
) where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    // FuturesUnordered first polls futures in push order, so `on_message`
    // is entered in arrival order.
    let mut in_flight = FuturesUnordered::new();
    let mut open = true;
    while open || !in_flight.is_empty() {
        tokio::select! {
            next = rx.recv(), if open => match next {
                Some(inbound) => {
                    in_flight.push(dispatch_one(handler.as_ref(), &connection_id, inbound, &deliver));
                }
                None => open = false,
            },
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
        }
    }
    debug!(connection_id = %connection_id, "dispatch loop finished");
}

/// Run one message through the handler and deliver the reply.
///
/// A panicking handler still answers a request with `INTERNAL_ERROR`,
/// correlated by the id recovered from the raw text.
async fn dispatch_one<F, Fut>(
    handler: &dyn ConnectionHandler,
    connection_id: &ConnectionId,
    inbound: Inbound,
    deliver: &F,
) where
    F: Fn(Message) -> Fut,
    Fut: Future<Output = ()>,
{
    let Inbound { raw, metadata } = inbound;
    let outcome = AssertUnwindSafe(handler.on_message(connection_id, &raw, metadata))
        .catch_unwind()
        .await;
    let reply = match outcome {
        Ok(reply) => reply,
        Err(_) => {
            error!(connection_id = %connection_id, "dispatch panicked");
            extract_request_id(&raw).map(|id| {
                RpcError::Internal {
                    message: "internal error".to_string(),
                }
                .into_message(Some(id))
            })
        }
    };
    if let Some(reply) = reply {
        deliver(reply).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_core::MessageId;
    use conduit_core::errors::codes;
    use conduit_rpc::ConnectionInfo;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::time::Duration;

    /// Records the order `on_message` is entered, then sleeps for
    /// `params.ms` before answering.
    #[derive(Default)]
    struct Recording {
        entered: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl ConnectionHandler for Recording {
        async fn on_connect(&self, _: &ConnectionId, _: ConnectionInfo) {}
        async fn on_disconnect(&self, _: &ConnectionId) {}
        async fn on_message(&self, _: &ConnectionId, raw: &str, _: RequestMetadata) -> Option<Message> {
            let value: Value = serde_json::from_str(raw).ok()?;
            if value["method"] == "boom" {
                panic!("handler exploded");
            }
            let id = value["id"].as_i64()?;
            self.entered.lock().push(id);
            let ms = value["params"]["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Some(Message::response(MessageId::Number(id), json!("ok")))
        }
    }

    fn request(id: i64, ms: u64) -> String {
        json!({"type": "request", "id": id, "method": "x", "params": {"ms": ms}}).to_string()
    }

    fn spawn_collecting(
        handler: Arc<Recording>,
    ) -> (DispatchQueue, JoinHandle<()>, mpsc::UnboundedReceiver<Message>) {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (queue, task) = DispatchQueue::spawn(handler, ConnectionId::from("c1"), move |reply| {
            let _ = reply_tx.send(reply);
            async {}
        });
        (queue, task, reply_rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn messages_enter_handler_in_arrival_order() {
        let handler = Arc::new(Recording::default());
        let (queue, task, mut replies) = spawn_collecting(Arc::clone(&handler));
        for n in 0..300 {
            assert!(queue.push(request(n, 0), RequestMetadata::default()));
        }
        drop(queue);
        task.await.unwrap();

        let entered = handler.entered.lock().clone();
        assert_eq!(entered, (0..300).collect::<Vec<_>>());
        let mut count = 0;
        while replies.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 300);
    }

    #[tokio::test]
    async fn slow_handler_does_not_hold_back_later_replies() {
        let handler = Arc::new(Recording::default());
        let (queue, task, mut replies) = spawn_collecting(handler);
        let _ = queue.push(request(1, 200), RequestMetadata::default());
        let _ = queue.push(request(2, 0), RequestMetadata::default());

        let first = replies.recv().await.unwrap();
        assert_eq!(first.id(), Some(&MessageId::Number(2)));
        let second = replies.recv().await.unwrap();
        assert_eq!(second.id(), Some(&MessageId::Number(1)));
        drop(queue);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn panic_becomes_internal_error_with_id() {
        let handler = Arc::new(Recording::default());
        let (queue, task, mut replies) = spawn_collecting(handler);
        let _ = queue.push(r#"{"type":"request","id":7,"method":"boom"}"#, RequestMetadata::default());
        let _ = queue.push(request(8, 0), RequestMetadata::default());
        drop(queue);
        task.await.unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.id(), Some(&MessageId::Number(7)));
        let Message::Error { error, .. } = reply else {
            panic!("expected error");
        };
        assert_eq!(error.code, codes::INTERNAL_ERROR);
        assert_eq!(replies.recv().await.unwrap().id(), Some(&MessageId::Number(8)));
    }

    #[tokio::test]
    async fn panic_without_id_is_silent() {
        let handler = Arc::new(Recording::default());
        let (queue, task, mut replies) = spawn_collecting(handler);
        let _ = queue.push(r#"{"type":"event","method":"boom"}"#, RequestMetadata::default());
        drop(queue);
        task.await.unwrap();
        assert!(replies.try_recv().is_err());
    }
}
