//! Concurrency admission with a bounded FIFO wait queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Both the in-flight limit and the wait queue are full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("server overloaded")]
pub struct Overloaded;

#[derive(Debug)]
struct State {
    in_flight: usize,
    waiters: VecDeque<oneshot::Sender<AdmissionPermit>>,
}

/// Gate limiting in-flight requests to `max_concurrent`, with up to
/// `max_queue_depth` callers waiting in arrival order.
#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    max_concurrent: usize,
    max_queue_depth: usize,
    state: Arc<Mutex<State>>,
}

/// One in-flight slot. Dropping it hands the slot to the oldest waiter, or
/// frees it.
#[derive(Debug)]
pub struct AdmissionPermit {
    state: Option<Arc<Mutex<State>>>,
}

impl AdmissionQueue {
    /// Queue with the given limits.
    pub fn new(max_concurrent: usize, max_queue_depth: usize) -> Self {
        Self {
            max_concurrent,
            max_queue_depth,
            state: Arc::new(Mutex::new(State {
                in_flight: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Wait for a slot, or fail immediately if the queue is full.
    ///
    /// Cancelling the returned future abandons the queue position; a permit
    /// handed to an abandoned waiter is passed on.
    pub async fn acquire(&self) -> Result<AdmissionPermit, Overloaded> {
        let rx = {
            let mut state = self.state.lock();
            if state.in_flight < self.max_concurrent {
                state.in_flight += 1;
                return Ok(self.permit());
            }
            state.waiters.retain(|w| !w.is_closed());
            if state.waiters.len() >= self.max_queue_depth {
                return Err(Overloaded);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        // The sender side is only dropped by `retain` once this receiver is
        // gone, so a closed channel here means the queue itself was dropped.
        rx.await.map_err(|_| Overloaded)
    }

    /// Requests holding a slot.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Live waiters.
    pub fn queued(&self) -> usize {
        self.state.lock().waiters.iter().filter(|w| !w.is_closed()).count()
    }

    fn permit(&self) -> AdmissionPermit {
        AdmissionPermit {
            state: Some(Arc::clone(&self.state)),
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let Some(shared) = self.state.take() else {
            return;
        };
        loop {
            let next = {
                let mut state = shared.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.in_flight = state.in_flight.saturating_sub(1);
                        return;
                    }
                }
            };
            let handoff = AdmissionPermit {
                state: Some(Arc::clone(&shared)),
            };
            match next.send(handoff) {
                Ok(()) => return,
                // Waiter gave up; disarm the returned permit and try the next.
                Err(mut returned) => {
                    let _ = returned.state.take();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_under_limit() {
        let q = AdmissionQueue::new(2, 0);
        let a = q.acquire().await.unwrap();
        let _b = q.acquire().await.unwrap();
        assert_eq!(q.in_flight(), 2);
        drop(a);
        assert_eq!(q.in_flight(), 1);
    }

    #[tokio::test]
    async fn rejects_when_queue_full() {
        let q = AdmissionQueue::new(1, 0);
        let _a = q.acquire().await.unwrap();
        assert_eq!(q.acquire().await.unwrap_err(), Overloaded);
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let q = AdmissionQueue::new(1, 2);
        let first = q.acquire().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for n in 0..2 {
            let qc = q.clone();
            let order_tx = order_tx.clone();
            handles.push(tokio::spawn(async move {
                let permit = qc.acquire().await.unwrap();
                order_tx.send(n).unwrap();
                drop(permit);
            }));
            // Let the waiter enqueue before spawning the next one.
            while q.queued() <= n {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(q.acquire().await.unwrap_err(), Overloaded);

        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(order_rx.recv().await, Some(0));
        assert_eq!(order_rx.recv().await, Some(1));
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_slot() {
        let q = AdmissionQueue::new(1, 1);
        let first = q.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(10), q.acquire()).await;
        assert!(waiting.is_err());

        drop(first);
        assert_eq!(q.in_flight(), 0);
        let _again = q.acquire().await.unwrap();
        assert_eq!(q.in_flight(), 1);
    }

    #[tokio::test]
    async fn handoff_keeps_in_flight_count() {
        let q = AdmissionQueue::new(1, 1);
        let first = q.acquire().await.unwrap();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.acquire().await.unwrap() });
        while q.queued() == 0 {
            tokio::task::yield_now().await;
        }
        drop(first);
        let permit = waiter.await.unwrap();
        assert_eq!(q.in_flight(), 1);
        drop(permit);
        assert_eq!(q.in_flight(), 0);
    }
}
