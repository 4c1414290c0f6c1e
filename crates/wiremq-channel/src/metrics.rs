//! Channel metrics collection.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of channel metrics at a point in time.
pub struct MetricsSnapshot {
    /// Number of RPC requests sent.
    pub rpcs_sent: u64,
    /// Number of RPCs resolved with a reply.
    pub rpcs_completed: u64,
    /// Number of RPCs resolved with a failure.
    pub rpcs_failed: u64,
    /// Number of messages published.
    pub publishes: u64,
    /// Number of publish seqnos settled positively.
    pub confirms_acked: u64,
    /// Number of publish seqnos settled negatively.
    pub confirms_nacked: u64,
    /// Number of confirm waits that timed out.
    pub confirm_timeouts: u64,
    /// Number of deliveries handed to a consumer queue.
    pub deliveries_dispatched: u64,
    /// Number of deliveries dropped for want of a consumer.
    pub deliveries_dropped: u64,
}

/// Thread-safe channel metrics collector.
pub struct ChannelMetrics {
    rpcs_sent: AtomicU64,
    rpcs_completed: AtomicU64,
    rpcs_failed: AtomicU64,
    publishes: AtomicU64,
    confirms_acked: AtomicU64,
    confirms_nacked: AtomicU64,
    confirm_timeouts: AtomicU64,
    deliveries_dispatched: AtomicU64,
    deliveries_dropped: AtomicU64,
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ChannelMetrics {
    /// Creates a new ChannelMetrics instance with all counters initialized to zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rpcs_sent: AtomicU64::new(0),
            rpcs_completed: AtomicU64::new(0),
            rpcs_failed: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
            confirms_acked: AtomicU64::new(0),
            confirms_nacked: AtomicU64::new(0),
            confirm_timeouts: AtomicU64::new(0),
            deliveries_dispatched: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
        }
    }

    /// Increments the RPCs sent counter.
    pub fn inc_rpcs_sent(&self) {
        self.rpcs_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the RPCs completed counter.
    pub fn inc_rpcs_completed(&self) {
        self.rpcs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the RPCs failed counter.
    pub fn add_rpcs_failed(&self, count: u64) {
        self.rpcs_failed.fetch_add(count, Ordering::Relaxed);
    }

    /// Increments the publishes counter.
    pub fn inc_publishes(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the acked-seqnos counter.
    pub fn add_confirms_acked(&self, count: u64) {
        self.confirms_acked.fetch_add(count, Ordering::Relaxed);
    }

    /// Adds to the nacked-seqnos counter.
    pub fn add_confirms_nacked(&self, count: u64) {
        self.confirms_nacked.fetch_add(count, Ordering::Relaxed);
    }

    /// Increments the confirm-timeouts counter.
    pub fn inc_confirm_timeouts(&self) {
        self.confirm_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the deliveries dispatched counter.
    pub fn inc_deliveries_dispatched(&self) {
        self.deliveries_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the deliveries dropped counter.
    pub fn inc_deliveries_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rpcs_sent: self.rpcs_sent.load(Ordering::Relaxed),
            rpcs_completed: self.rpcs_completed.load(Ordering::Relaxed),
            rpcs_failed: self.rpcs_failed.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            confirms_acked: self.confirms_acked.load(Ordering::Relaxed),
            confirms_nacked: self.confirms_nacked.load(Ordering::Relaxed),
            confirm_timeouts: self.confirm_timeouts.load(Ordering::Relaxed),
            deliveries_dispatched: self.deliveries_dispatched.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    #[test]
    fn test_metrics_new() {
        let metrics = ChannelMetrics::new();
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.rpcs_sent, 0);
        assert_eq!(snapshot.rpcs_completed, 0);
        assert_eq!(snapshot.rpcs_failed, 0);
        assert_eq!(snapshot.publishes, 0);
        assert_eq!(snapshot.confirms_acked, 0);
        assert_eq!(snapshot.confirms_nacked, 0);
        assert_eq!(snapshot.confirm_timeouts, 0);
        assert_eq!(snapshot.deliveries_dispatched, 0);
        assert_eq!(snapshot.deliveries_dropped, 0);
    }

    #[test]
    fn test_inc_counters() {
        let metrics = ChannelMetrics::new();

        metrics.inc_rpcs_sent();
        metrics.inc_rpcs_completed();
        metrics.add_rpcs_failed(2);
        metrics.inc_publishes();
        metrics.add_confirms_acked(3);
        metrics.add_confirms_nacked(1);
        metrics.inc_confirm_timeouts();
        metrics.inc_deliveries_dispatched();
        metrics.inc_deliveries_dropped();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.rpcs_sent, 1);
        assert_eq!(snapshot.rpcs_completed, 1);
        assert_eq!(snapshot.rpcs_failed, 2);
        assert_eq!(snapshot.publishes, 1);
        assert_eq!(snapshot.confirms_acked, 3);
        assert_eq!(snapshot.confirms_nacked, 1);
        assert_eq!(snapshot.confirm_timeouts, 1);
        assert_eq!(snapshot.deliveries_dispatched, 1);
        assert_eq!(snapshot.deliveries_dropped, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ChannelMetrics::new();
        metrics.inc_publishes();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["publishes"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_metrics() {
        let metrics = Arc::new(ChannelMetrics::new());
        let num_tasks = 10;
        let increments_per_task = 100;

        let mut join_set = JoinSet::new();

        for _ in 0..num_tasks {
            let metrics = Arc::clone(&metrics);
            join_set.spawn(async move {
                for _ in 0..increments_per_task {
                    metrics.inc_rpcs_sent();
                    metrics.add_confirms_acked(2);
                }
            });
        }

        while join_set.join_next().await.is_some() {}

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.rpcs_sent, num_tasks as u64 * increments_per_task as u64);
        assert_eq!(snapshot.confirms_acked, num_tasks as u64 * increments_per_task as u64 * 2);
    }
}
