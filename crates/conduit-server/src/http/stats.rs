//! Running totals exposed on `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

use crate::health::RejectedTotals;
use crate::metrics::{HTTP_REJECTED_TOTAL, HTTP_REQUESTS_TOTAL, HTTP_TIMEOUTS_TOTAL};

/// Admission step that refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    Auth,
    Quota,
    Circuit,
    Overload,
}

impl Rejection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::Circuit => "circuit",
            Self::Overload => "overload",
        }
    }
}

/// Per-transport request counters. Each update also goes to the `metrics`
/// facade.
#[derive(Debug, Default)]
pub struct HttpStats {
    requests: AtomicU64,
    rejected_auth: AtomicU64,
    rejected_quota: AtomicU64,
    rejected_circuit: AtomicU64,
    rejected_overload: AtomicU64,
    timeouts: AtomicU64,
}

impl HttpStats {
    pub(crate) fn record_request(&self) {
        let _ = self.requests.fetch_add(1, Ordering::Relaxed);
        counter!(HTTP_REQUESTS_TOTAL).increment(1);
    }

    pub(crate) fn record_rejection(&self, reason: Rejection) {
        let slot = match reason {
            Rejection::Auth => &self.rejected_auth,
            Rejection::Quota => &self.rejected_quota,
            Rejection::Circuit => &self.rejected_circuit,
            Rejection::Overload => &self.rejected_overload,
        };
        let _ = slot.fetch_add(1, Ordering::Relaxed);
        counter!(HTTP_REJECTED_TOTAL, "reason" => reason.as_str()).increment(1);
    }

    pub(crate) fn record_timeout(&self) {
        let _ = self.timeouts.fetch_add(1, Ordering::Relaxed);
        counter!(HTTP_TIMEOUTS_TOTAL).increment(1);
    }

    /// Requests received.
    pub fn requests_total(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Requests that hit the reply deadline.
    pub fn timeouts_total(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Rejections by reason.
    pub fn rejected(&self) -> RejectedTotals {
        RejectedTotals {
            auth: self.rejected_auth.load(Ordering::Relaxed),
            quota: self.rejected_quota.load(Ordering::Relaxed),
            circuit: self.rejected_circuit.load(Ordering::Relaxed),
            overload: self.rejected_overload.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_reason() {
        let stats = HttpStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_rejection(Rejection::Quota);
        stats.record_rejection(Rejection::Overload);
        stats.record_rejection(Rejection::Overload);
        stats.record_timeout();

        assert_eq!(stats.requests_total(), 2);
        assert_eq!(stats.timeouts_total(), 1);
        let rejected = stats.rejected();
        assert_eq!(rejected.quota, 1);
        assert_eq!(rejected.overload, 2);
        assert_eq!(rejected.auth, 0);
    }
}
