//! Liveness status vocabulary shared by the detection server and its
//! consumers.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// The liveness verdict for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStatus {
    /// True when the peer is considered failed.
    pub failed: bool,
}

impl FailureStatus {
    /// An available peer.
    pub fn available() -> Self {
        Self { failed: false }
    }

    /// A failed peer.
    pub fn failed() -> Self {
        Self { failed: true }
    }

    /// True when the peer is available.
    pub fn is_available(&self) -> bool {
        !self.failed
    }
}

impl Default for FailureStatus {
    fn default() -> Self {
        Self::available()
    }
}

/// One entry of the ordered status change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFailureStatus {
    /// The peer whose status changed.
    pub address: SocketAddr,
    /// The new status.
    pub status: FailureStatus,
}

impl SystemFailureStatus {
    /// Creates a change-log entry.
    pub fn new(address: SocketAddr, status: FailureStatus) -> Self {
        Self { address, status }
    }
}

/// Per-peer request bookkeeping kept by the detection server.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusEntry {
    pub status: FailureStatus,
    pub last_request_time: f64,
    pub penultimate_request_time: f64,
}

impl StatusEntry {
    /// Unknown peers start out failed; their first report produces a
    /// visible status change.
    pub fn new() -> Self {
        Self {
            status: FailureStatus::failed(),
            last_request_time: 0.0,
            penultimate_request_time: 0.0,
        }
    }

    /// Shifts the request-time window forward.
    pub fn insert_request(&mut self, now: f64) {
        self.penultimate_request_time = self.last_request_time;
        self.last_request_time = now;
    }

    /// Worst-case request gap: either the peer has gone quiet, or its last
    /// two requests were far apart. Keeps the detector honest when requests
    /// stop arriving entirely.
    pub fn latency(&self, now: f64) -> f64 {
        (now - self.last_request_time).max(self.last_request_time - self.penultimate_request_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_request_shifts_window() {
        let mut entry = StatusEntry::new();
        entry.insert_request(1.0);
        entry.insert_request(3.0);
        assert_eq!(entry.penultimate_request_time, 1.0);
        assert_eq!(entry.last_request_time, 3.0);
    }

    #[test]
    fn test_latency_is_worst_gap() {
        let mut entry = StatusEntry::new();
        entry.insert_request(1.0);
        entry.insert_request(10.0);
        // Inter-request gap (9) dominates the quiet period (2).
        assert_eq!(entry.latency(12.0), 9.0);
        // Quiet period dominates later.
        assert_eq!(entry.latency(25.0), 15.0);
    }
}
