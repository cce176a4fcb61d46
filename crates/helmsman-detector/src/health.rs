//! Per-peer connection-health metrics.
//!
//! Workers aggregate these locally and publish them to the controller;
//! the controller only retains the latest record per peer. The contract is
//! the metrics record itself: a failed flag, a closed-connection count over
//! a sliding window, and optional slow/total latency counts.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Entries observed within the trailing window; older entries are purged
/// on every access.
#[derive(Debug, Clone)]
pub struct SlidingWindowStat {
    entries: std::collections::VecDeque<f64>,
    window_secs: f64,
}

impl SlidingWindowStat {
    /// Creates a window of the given duration.
    pub fn new(window_secs: f64) -> Self {
        Self { entries: std::collections::VecDeque::new(), window_secs }
    }

    /// Records an event at `now`.
    pub fn add(&mut self, now: f64) {
        self.sweep(now);
        self.entries.push_back(now);
    }

    /// Events still inside the window at `now`.
    pub fn count(&mut self, now: f64) -> usize {
        self.sweep(now);
        self.entries.len()
    }

    fn sweep(&mut self, now: f64) {
        let cutoff = now - self.window_secs;
        while self.entries.front().is_some_and(|&t| t < cutoff) {
            self.entries.pop_front();
        }
    }
}

/// Closed-connection counts per peer over a sliding window.
#[derive(Debug, Clone)]
pub struct ClosedConnectionStats {
    counters: HashMap<SocketAddr, SlidingWindowStat>,
    window_secs: f64,
    max_closed: usize,
}

impl ClosedConnectionStats {
    /// Creates stats with the given window and limit.
    pub fn new(window_secs: f64, max_closed: usize) -> Self {
        Self { counters: HashMap::new(), window_secs, max_closed }
    }

    /// Records a closed connection to `peer` at `now`.
    pub fn add(&mut self, peer: SocketAddr, now: f64) {
        self.counters
            .entry(peer)
            .or_insert_with(|| SlidingWindowStat::new(self.window_secs))
            .add(now);
    }

    /// Closed connections to `peer` within the window.
    pub fn count(&mut self, peer: SocketAddr, now: f64) -> usize {
        self.counters.get_mut(&peer).map_or(0, |s| s.count(now))
    }

    /// True when the peer exceeded the closed-connection limit.
    pub fn limit_exceeded(&mut self, peer: SocketAddr, now: f64) -> bool {
        self.count(peer, now) > self.max_closed
    }
}

/// Slow and total reply counts for one latency-sensitive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LatencyCounts {
    /// Replies slower than the path's threshold.
    pub slow: u64,
    /// Total replies.
    pub total: u64,
}

/// The aggregated health record published to the controller per peer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailureMetrics {
    /// Whether the publisher currently considers the peer failed.
    pub failed: bool,
    /// Closed connections to the peer within the window.
    pub failed_connection_count: usize,
    /// Log-push latency counts, when the publisher tracks them.
    pub log_push_latencies: Option<LatencyCounts>,
    /// Commit-resolution latency counts, when tracked.
    pub commit_resolving_latencies: Option<LatencyCounts>,
}

/// Aggregates local connection observations into [`FailureMetrics`].
#[derive(Debug)]
pub struct HealthMonitor {
    closed_connections: ClosedConnectionStats,
}

impl HealthMonitor {
    /// Creates a monitor with the given closed-connection window and limit.
    pub fn new(window_secs: f64, max_closed: usize) -> Self {
        Self { closed_connections: ClosedConnectionStats::new(window_secs, max_closed) }
    }

    /// Records a closed connection.
    pub fn report_closed(&mut self, peer: SocketAddr, now: f64) {
        self.closed_connections.add(peer, now);
    }

    /// Builds the record for `peer`; the failed flag is supplied by the
    /// caller's failure-monitor view.
    pub fn aggregate(&mut self, peer: SocketAddr, failed: bool, now: f64) -> FailureMetrics {
        FailureMetrics {
            failed,
            failed_connection_count: self.closed_connections.count(peer, now),
            log_push_latencies: None,
            commit_resolving_latencies: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "10.0.0.9:4500".parse().unwrap()
    }

    #[test]
    fn test_window_purges_old_entries() {
        let mut stat = SlidingWindowStat::new(10.0);
        stat.add(1.0);
        stat.add(5.0);
        assert_eq!(stat.count(6.0), 2);
        assert_eq!(stat.count(12.0), 1);
        assert_eq!(stat.count(20.0), 0);
    }

    #[test]
    fn test_closed_connection_limit() {
        let mut stats = ClosedConnectionStats::new(30.0, 2);
        for t in [1.0, 2.0, 3.0] {
            stats.add(addr(), t);
        }
        assert!(stats.limit_exceeded(addr(), 4.0));
        assert!(!stats.limit_exceeded(addr(), 40.0));
    }

    #[test]
    fn test_aggregate_metrics() {
        let mut monitor = HealthMonitor::new(30.0, 5);
        monitor.report_closed(addr(), 1.0);
        monitor.report_closed(addr(), 2.0);

        let metrics = monitor.aggregate(addr(), false, 3.0);
        assert!(!metrics.failed);
        assert_eq!(metrics.failed_connection_count, 2);
        assert!(metrics.log_push_latencies.is_none());
    }
}
