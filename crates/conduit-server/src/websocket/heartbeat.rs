//! Heartbeat ping/pong liveness and idle monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::{ClientConnection, CloseReason};

/// Outcome of a monitor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorResult {
    /// The monitor requested a close.
    Closed(CloseReason),
    /// The connection closed for another reason.
    Cancelled,
}

/// Ping every `interval`; a connection that has not answered the previous
/// ping by the next tick is terminated without a close frame.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    cancel: CancellationToken,
) -> MonitorResult {
    let mut ticker = time::interval(interval);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !connection.check_alive() {
                    warn!(connection_id = %connection.id, "no pong within heartbeat interval, terminating");
                    connection.request_close(CloseReason::HeartbeatTimeout);
                    return MonitorResult::Closed(CloseReason::HeartbeatTimeout);
                }
                connection.send_ping();
            }
            () = cancel.cancelled() => return MonitorResult::Cancelled,
        }
    }
}

/// Check every `idle_timeout / 2`; close with 4001 once the connection has
/// been idle for longer than `idle_timeout`.
pub async fn run_idle_watch(
    connection: Arc<ClientConnection>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> MonitorResult {
    let mut ticker = time::interval((idle_timeout / 2).max(Duration::from_millis(1)));
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let idle = connection.idle_for();
                if idle > idle_timeout {
                    debug!(connection_id = %connection.id, idle_ms = idle.as_millis(), "closing idle connection");
                    connection.request_close(CloseReason::IdleTimeout);
                    return MonitorResult::Closed(CloseReason::IdleTimeout);
                }
            }
            () = cancel.cancelled() => return MonitorResult::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::ConnectionId;
    use tokio::sync::mpsc;

    use super::super::connection::Outbound;

    fn make_connection() -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = Arc::new(ClientConnection::new(ConnectionId::from("hb_conn"), tx, 1024));
        let _ = conn.mark_open();
        (conn, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_cancelled() {
        let (conn, _rx) = make_connection();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(conn, Duration::from_secs(1), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), MonitorResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_then_terminates_silent_peer() {
        let (conn, mut rx) = make_connection();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&conn),
            Duration::from_secs(1),
            CancellationToken::new(),
        ));

        let result = handle.await.unwrap();
        assert_eq!(result, MonitorResult::Closed(CloseReason::HeartbeatTimeout));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Ping)));
        assert_eq!(conn.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_survives_while_pongs_arrive() {
        let (conn, _rx) = make_connection();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&conn),
            Duration::from_secs(1),
            cancel.clone(),
        ));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1_100)).await;
            conn.mark_alive();
        }
        assert!(!handle.is_finished());
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), MonitorResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_watch_closes_idle_connection() {
        let (conn, _rx) = make_connection();
        let started = tokio::time::Instant::now();
        let result = run_idle_watch(
            Arc::clone(&conn),
            Duration::from_secs(10),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, MonitorResult::Closed(CloseReason::IdleTimeout));
        // Checks run at 5s, 10s, 15s; the first one past the timeout closes.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_watch_resets_on_activity() {
        let (conn, _rx) = make_connection();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_idle_watch(
            Arc::clone(&conn),
            Duration::from_secs(10),
            cancel.clone(),
        ));
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            conn.touch();
        }
        assert!(!handle.is_finished());
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), MonitorResult::Cancelled);
    }
}
