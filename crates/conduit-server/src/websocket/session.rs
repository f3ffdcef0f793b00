//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through cleanup.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use conduit_core::{ConnectionId, Message, TransportKind};
use conduit_rpc::errors::extract_request_id;
use conduit_rpc::{ConnectionHandler, ConnectionInfo, Identity, RequestMetadata, RpcError};
use conduit_settings::WebSocketSettings;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, CloseReason, Outbound};
use super::heartbeat::{run_heartbeat, run_idle_watch};
use super::registry::{CapacitySlot, ConnectionRegistry};
use crate::auth::Authenticator;
use crate::dispatch::DispatchQueue;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_FRAMES_DROPPED_TOTAL,
};
use crate::resilience::MessageRateLimiter;

/// Writer queue depth; byte-level backpressure is enforced separately.
const OUTBOUND_QUEUE: usize = 1024;

/// How long teardown waits for the writer to flush a close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by every session of one transport.
pub(crate) struct WsShared {
    pub(crate) settings: WebSocketSettings,
    pub(crate) handler: Arc<dyn ConnectionHandler>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) registry: ConnectionRegistry,
    /// Running sessions; closed while the transport is stopping.
    pub(crate) sessions: TaskTracker,
}

/// Close an upgraded socket that was refused before admission.
pub(crate) async fn reject(mut socket: WebSocket, reason: CloseReason) {
    let _ = socket
        .send(WsMessage::Close(Some(close_frame(reason))))
        .await;
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    CloseFrame {
        code: reason.code(),
        reason: Utf8Bytes::from_static(reason.description()),
    }
}

/// Run a WebSocket session for an admitted client.
///
/// 1. Registers the connection and notifies the handler
/// 2. Sends a `connection.established` event with the connection id
/// 3. Hands inbound text frames to the dispatch loop in arrival order
/// 4. Runs the heartbeat and idle monitors
/// 5. Cleans up exactly once, whatever ended the session
#[instrument(skip_all, fields(connection_id = %connection_id))]
pub(crate) async fn run_ws_session(
    socket: WebSocket,
    connection_id: ConnectionId,
    identity: Option<Identity>,
    shared: Arc<WsShared>,
    slot: CapacitySlot,
) {
    let settings = &shared.settings;
    let (ws_tx, mut ws_rx) = socket.split();
    let (send_tx, send_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let connection = Arc::new(ClientConnection::new(
        connection_id.clone(),
        send_tx,
        settings.high_water_mark,
    ));

    shared.registry.insert(Arc::clone(&connection));
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(authenticated = identity.is_some(), "client connected");

    shared
        .handler
        .on_connect(
            &connection_id,
            ConnectionInfo::new(TransportKind::WebSocket).with_identity(identity),
        )
        .await;

    let mut writer = tokio::spawn(run_writer(ws_tx, send_rx, Arc::clone(&connection)));
    let (dispatch, dispatch_task) = DispatchQueue::spawn(
        Arc::clone(&shared.handler),
        connection_id.clone(),
        {
            let connection = Arc::clone(&connection);
            move |reply: Message| {
                if let Err(e) = connection.send(&reply) {
                    warn!(connection_id = %connection.id, error = %e, "failed to deliver reply");
                }
                futures::future::ready(())
            }
        },
    );
    // Requests still running finish on their own; their replies are dropped
    // once the connection is closed.
    drop(dispatch_task);

    if connection.mark_open() {
        let established = Message::event(
            "connection.established",
            Some(json!({
                "connectionId": connection_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        );
        if let Err(e) = connection.send(&established) {
            debug!(error = %e, "failed to queue connection.established");
        }
    }

    let monitors = [
        tokio::spawn(run_heartbeat(
            Arc::clone(&connection),
            settings.heartbeat_interval(),
            connection.cancel_token().clone(),
        )),
        tokio::spawn(run_idle_watch(
            Arc::clone(&connection),
            settings.idle_timeout(),
            connection.cancel_token().clone(),
        )),
    ];

    let mut limiter =
        MessageRateLimiter::new(settings.messages_per_second, settings.messages_per_minute);
    let cancel = connection.cancel_token().clone();

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let text = match frame {
            None => {
                connection.request_close(CloseReason::PeerClosed);
                break;
            }
            Some(Err(e)) => {
                let reason = if is_capacity_error(&e) {
                    CloseReason::MessageTooBig
                } else {
                    CloseReason::ReadError
                };
                debug!(error = %e, reason = reason.as_str(), "read failed");
                connection.request_close(reason);
                break;
            }
            Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
            // Some clients send text payloads in binary frames.
            Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "dropping non-UTF8 binary frame");
                    connection.touch();
                    let _ = connection.send(
                        &RpcError::Parse {
                            message: "binary frame is not valid UTF-8".into(),
                        }
                        .into_message(None),
                    );
                    continue;
                }
            },
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                connection.mark_alive();
                continue;
            }
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(code = ?frame.as_ref().map(|f| f.code), "client sent close frame");
                connection.request_close(CloseReason::PeerClosed);
                break;
            }
        };

        connection.touch();
        handle_text(&shared, &connection, &dispatch, &mut limiter, text);
    }
    drop(dispatch);

    // Let the writer flush a close frame if the reason calls for one. A peer
    // that stopped reading cannot hold teardown up.
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!("writer did not flush in time, aborting");
        writer.abort();
    }
    for monitor in monitors {
        monitor.abort();
    }
    cleanup(&shared, &connection).await;
    drop(slot);
}

fn handle_text(
    shared: &Arc<WsShared>,
    connection: &Arc<ClientConnection>,
    dispatch: &DispatchQueue,
    limiter: &mut MessageRateLimiter,
    text: String,
) {
    let limit = shared.settings.max_message_size;
    if text.len() > limit {
        counter!(WS_FRAMES_DROPPED_TOTAL, "reason" => "too_large").increment(1);
        debug!(size = text.len(), limit, "frame exceeds max message size");
        let reply = RpcError::MessageTooLarge {
            size: text.len(),
            limit,
        }
        .into_message(extract_request_id(&text));
        if let Err(e) = connection.send(&reply) {
            debug!(error = %e, "failed to send size error");
        }
        return;
    }

    let snapshot = match limiter.check() {
        Ok(snapshot) => snapshot,
        Err(retry_after) => {
            counter!(WS_FRAMES_DROPPED_TOTAL, "reason" => "rate_limited").increment(1);
            let reply = RpcError::RateLimited {
                retry_after_ms: u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            }
            .into_message(extract_request_id(&text));
            if let Err(e) = connection.send(&reply) {
                debug!(error = %e, "failed to send rate limit error");
            }
            return;
        }
    };

    if !dispatch.push(text, RequestMetadata::with_rate_limit(snapshot)) {
        debug!("dispatch loop gone, dropping frame");
    }
}

/// Forward queued frames to the socket until the connection is closed,
/// then send the close frame the close reason calls for.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
    connection: Arc<ClientConnection>,
) {
    let cancel = connection.cancel_token().clone();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => next,
        };
        let (frame, len) = match next {
            Some(Outbound::Text(text)) => {
                let len = text.len();
                (WsMessage::Text(text.into()), len)
            }
            Some(Outbound::Ping) => (WsMessage::Ping(Vec::new().into()), 0),
            None => break,
        };
        // A peer that stopped reading blocks the send; cancellation must
        // still get through.
        let sent = tokio::select! {
            () = cancel.cancelled() => None,
            sent = ws_tx.send(frame) => Some(sent),
        };
        connection.release(len);
        match sent {
            None => break,
            Some(Err(_)) => {
                connection.request_close(CloseReason::ReadError);
                break;
            }
            Some(Ok(())) => {}
        }
    }

    let Some(reason) = connection.close_reason().filter(|r| r.sends_close_frame()) else {
        return;
    };
    // Flush replies queued before the close was requested.
    while let Ok(next) = rx.try_recv() {
        if let Outbound::Text(text) = next {
            let len = text.len();
            let sent = ws_tx.send(WsMessage::Text(text.into())).await;
            connection.release(len);
            if sent.is_err() {
                return;
            }
        }
    }
    let _ = ws_tx.send(WsMessage::Close(Some(close_frame(reason)))).await;
}

/// The single teardown path.
async fn cleanup(shared: &WsShared, connection: &Arc<ClientConnection>) {
    if !connection.begin_cleanup() {
        return;
    }
    let reason = connection.close_reason().unwrap_or(CloseReason::PeerClosed);
    let _ = shared.registry.remove(&connection.id);

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    info!(
        reason = reason.as_str(),
        code = reason.code(),
        duration_ms = connection.age().as_millis(),
        "client disconnected"
    );

    shared.handler.on_disconnect(&connection.id).await;
}

/// Whether a read error is the frame-size cap being hit.
///
/// The server's WebSocket error type is opaque, so this matches the
/// message tungstenite produces for capacity errors.
fn is_capacity_error(err: &axum::Error) -> bool {
    let text = err.to_string();
    text.contains("Space limit exceeded") || text.contains("Message too long")
}
