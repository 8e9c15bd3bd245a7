//! Lightweight in-process counters/gauges the orchestration layer exposes
//! for an admin surface or a future metrics exporter, implemented as
//! plain atomics rather than pulling in a metrics crate for a handful of
//! numbers.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct GatewayMetrics {
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub billing_discarded: AtomicU64,
    pub sse_dropped: AtomicU64,
    pub health_probes_failed: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, failed: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            billing_discarded: self.billing_discarded.load(Ordering::Relaxed),
            sse_dropped: self.sse_dropped.load(Ordering::Relaxed),
            health_probes_failed: self.health_probes_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub billing_discarded: u64,
    pub sse_dropped: u64,
    pub health_probes_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_tracks_failures_separately() {
        let metrics = GatewayMetrics::new();
        metrics.record_request(false);
        metrics.record_request(true);
        let snap = metrics.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.requests_failed, 1);
    }
}
