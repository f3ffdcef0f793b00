//! WebSocket client connection state.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use conduit_core::{ConnectionId, Message};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::WS_BACKPRESSURE_TOTAL;
use crate::transport::TransportError;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Upgraded, not yet announced to the handler.
    Connecting = 0,
    /// Accepting traffic.
    Open = 1,
    /// A close was requested; sends are refused.
    Closing = 2,
    /// Cleaned up.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended.
    PeerClosed,
    /// Reading from the socket failed.
    ReadError,
    /// Frame above the hard protocol cap.
    MessageTooBig,
    /// No pong within a heartbeat interval.
    HeartbeatTimeout,
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
    /// The transport is stopping.
    ServerShutdown,
    /// Refused by the credential gate.
    PolicyViolation,
    /// Connection limit reached.
    AtCapacity,
}

impl CloseReason {
    /// Close code for this reason. `HeartbeatTimeout` records 4000 but the
    /// socket is dropped without a close frame.
    pub fn code(self) -> u16 {
        match self {
            Self::PeerClosed => 1000,
            Self::ServerShutdown => 1001,
            Self::ReadError => 1006,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::AtCapacity => 1013,
            Self::HeartbeatTimeout => 4000,
            Self::IdleTimeout => 4001,
        }
    }

    /// Whether the server sends a close frame for this reason.
    pub fn sends_close_frame(self) -> bool {
        !matches!(self, Self::PeerClosed | Self::ReadError | Self::HeartbeatTimeout)
    }

    /// Text carried in the close frame.
    pub fn description(self) -> &'static str {
        match self {
            Self::PeerClosed => "normal closure",
            Self::ReadError => "read error",
            Self::MessageTooBig => "message too big",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::IdleTimeout => "idle timeout",
            Self::ServerShutdown => "server shutting down",
            Self::PolicyViolation => "unauthorized",
            Self::AtCapacity => "server at capacity",
        }
    }

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::ReadError => "read_error",
            Self::MessageTooBig => "message_too_big",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::IdleTimeout => "idle_timeout",
            Self::ServerShutdown => "server_shutdown",
            Self::PolicyViolation => "policy_violation",
            Self::AtCapacity => "at_capacity",
        }
    }
}

/// Frame queued for the socket writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    Text(String),
    Ping,
}

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    state: AtomicU8,
    /// Send channel to the connection's write task.
    tx: mpsc::Sender<Outbound>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has responded to the last ping.
    is_alive: AtomicBool,
    last_activity: Mutex<Instant>,
    buffered: AtomicUsize,
    high_water_mark: usize,
    close_reason: Mutex<Option<CloseReason>>,
    /// Cancelled when a close is requested; stops the reader, writer, and timers.
    cancel: CancellationToken,
    cleaned_up: AtomicBool,
}

impl ClientConnection {
    /// Create a new connection in the `Connecting` state.
    pub(crate) fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>, high_water_mark: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            buffered: AtomicUsize::new(0),
            high_water_mark,
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Connecting` → `Open`. Fails if a close already began.
    pub(crate) fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Queue a message. Refused with `Backpressure` if the buffered byte
    /// count plus this frame would pass the high-water mark.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        let text = message.to_json()?;
        self.send_text(text)
    }

    pub(crate) fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Open {
            return Err(TransportError::ConnectionClosed(self.id.clone()));
        }
        let len = text.len();
        let limit = self.high_water_mark;
        if let Err(buffered) = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur + len <= limit).then_some(cur + len)
            })
        {
            counter!(WS_BACKPRESSURE_TOTAL).increment(1);
            return Err(TransportError::Backpressure { buffered, limit });
        }
        match self.tx.try_send(Outbound::Text(text)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.release(len);
                counter!(WS_BACKPRESSURE_TOTAL).increment(1);
                Err(TransportError::Backpressure {
                    buffered: self.buffered(),
                    limit,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.release(len);
                Err(TransportError::ConnectionClosed(self.id.clone()))
            }
        }
    }

    /// Queue a ping. Dropped silently if the writer is saturated.
    pub(crate) fn send_ping(&self) {
        let _ = self.tx.try_send(Outbound::Ping);
    }

    /// Bytes accepted by `send` but not yet written to the socket.
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub(crate) fn release(&self, len: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(len))
            });
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Record inbound traffic for the idle check.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound message.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Ask the session to close. The first reason wins.
    pub fn request_close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (s < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
        });
        self.cancel.cancel();
    }

    /// Reason recorded by the first `request_close`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Claim the one-time cleanup. Returns `false` if already claimed.
    pub(crate) fn begin_cleanup(&self) -> bool {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        self.cancel.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn make_connection(hwm: usize) -> (ClientConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(ConnectionId::from("conn_1"), tx, hwm);
        (conn, rx)
    }

    fn event() -> Message {
        Message::event("tick", Some(json!({"n": 1})))
    }

    #[test]
    fn starts_connecting_and_alive() {
        let (conn, _rx) = make_connection(1024);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn send_requires_open() {
        let (conn, _rx) = make_connection(1024);
        assert_matches!(conn.send(&event()), Err(TransportError::ConnectionClosed(_)));
        assert!(conn.mark_open());
        assert!(conn.send(&event()).is_ok());
    }

    #[tokio::test]
    async fn send_tracks_buffered_bytes() {
        let (conn, mut rx) = make_connection(1024);
        let _ = conn.mark_open();
        conn.send(&event()).unwrap();
        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        assert_eq!(conn.buffered(), text.len());
        conn.release(text.len());
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn backpressure_refuses_without_queueing() {
        let len = event().to_json().unwrap().len();
        let (conn, mut rx) = make_connection(len * 2);
        let _ = conn.mark_open();
        conn.send(&event()).unwrap();
        conn.send(&event()).unwrap();
        assert_matches!(
            conn.send(&event()),
            Err(TransportError::Backpressure { buffered, .. }) if buffered == len * 2
        );
        assert_eq!(conn.buffered(), len * 2);

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);
    }

    #[test]
    fn first_close_reason_wins() {
        let (conn, _rx) = make_connection(1024);
        let _ = conn.mark_open();
        conn.request_close(CloseReason::IdleTimeout);
        conn.request_close(CloseReason::PeerClosed);
        assert_eq!(conn.close_reason(), Some(CloseReason::IdleTimeout));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(conn.cancel_token().is_cancelled());
        assert!(!conn.mark_open());
    }

    #[test]
    fn cleanup_claimed_once() {
        let (conn, _rx) = make_connection(1024);
        assert!(conn.begin_cleanup());
        assert!(!conn.begin_cleanup());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::AtCapacity.code(), 1013);
        assert_eq!(CloseReason::PolicyViolation.code(), 1008);
        assert_eq!(CloseReason::IdleTimeout.code(), 4001);
        assert_eq!(CloseReason::HeartbeatTimeout.code(), 4000);
        assert!(!CloseReason::HeartbeatTimeout.sends_close_frame());
        assert!(CloseReason::ServerShutdown.sends_close_frame());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tracking() {
        let (conn, _rx) = make_connection(1024);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(conn.idle_for(), Duration::from_secs(5));
        conn.touch();
        assert_eq!(conn.idle_for(), Duration::ZERO);
    }
}
