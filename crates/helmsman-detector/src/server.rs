//! The failure-detection server.
//!
//! Every process in the cluster polls the controller with its last-seen
//! status version; the server answers with a delta-compressed slice of the
//! change log, or a full snapshot when the requester is too far behind.
//! A periodic tick declares peers failed on an adaptive timeout pivoted on
//! the second-highest observed request latency: one pathologically slow
//! peer must not raise everyone's tolerance, but two peers drifting
//! together usually indicate a real network condition and should.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use helmsman_core::error::{Error, Result};
use helmsman_core::knobs::Knobs;
use helmsman_core::types::Clock;

use crate::status::{FailureStatus, StatusEntry, SystemFailureStatus};

/// A poll from one process, carrying its view version and (for servers) its
/// own status.
#[derive(Debug)]
pub struct FailureMonitoringRequest {
    /// The requester's last-seen status version; 0 forces a full snapshot.
    pub failure_information_version: u64,
    /// The requester's own status; present for servers, absent for clients.
    pub sender_status: Option<FailureStatus>,
    /// Address the reply endpoint belongs to.
    pub reply_address: SocketAddr,
    /// Reply channel.
    pub reply: oneshot::Sender<Result<FailureMonitoringReply>>,
}

/// The server's answer to a poll.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureMonitoringReply {
    /// The server's current status version.
    pub failure_information_version: u64,
    /// How often the requester should poll, in milliseconds.
    pub client_request_interval_ms: u64,
    /// After how long the requester should consider the server failed.
    pub consider_server_failed_timeout_ms: u64,
    /// True when `changes` is a full snapshot rather than a delta.
    pub all_others_failed: bool,
    /// Ordered status changes since the requester's version, or the full
    /// current view.
    pub changes: Vec<SystemFailureStatus>,
}

/// Deterministic server state; all timing arrives as explicit timestamps.
pub(crate) struct DetectorCore {
    local_address: SocketAddr,
    knobs: Arc<Knobs>,
    current_version: u64,
    current_status: HashMap<SocketAddr, StatusEntry>,
    status_history: VecDeque<SystemFailureStatus>,
    /// Peers declared failed and since erased from the status vector.
    /// Addresses never heard from are presumed available, matching the
    /// client-side monitor default.
    declared_failed: std::collections::HashSet<SocketAddr>,
}

impl DetectorCore {
    fn new(local_address: SocketAddr, knobs: Arc<Knobs>) -> Self {
        Self {
            local_address,
            knobs,
            current_version: 0,
            current_status: HashMap::new(),
            status_history: VecDeque::new(),
            declared_failed: std::collections::HashSet::new(),
        }
    }

    fn record_change(&mut self, address: SocketAddr, status: FailureStatus) {
        self.status_history.push_back(SystemFailureStatus::new(address, status));
        self.current_version += 1;
        while self.status_history.len() > self.current_status.len() {
            self.status_history.pop_front();
        }
    }

    fn handle_request(
        &mut self,
        version: u64,
        sender_status: Option<FailureStatus>,
        reply_address: SocketAddr,
        now: f64,
    ) -> (Result<FailureMonitoringReply>, Option<SystemFailureStatus>) {
        let mut change = None;

        if let Some(status) = sender_status {
            if status.failed && reply_address == self.local_address {
                // A process must never report itself failed; drop the claim.
                warn!(address = %reply_address, "Ignoring self-reported failure");
            } else {
                let entry = self.current_status.entry(reply_address).or_insert_with(StatusEntry::new);
                entry.insert_request(now);
                if status != entry.status {
                    debug!(address = %reply_address, failed = status.failed, "Status changed by request");
                    entry.status = status;
                    self.record_change(reply_address, status);
                    change = Some(SystemFailureStatus::new(reply_address, status));
                }
                if status.is_available() {
                    self.declared_failed.remove(&reply_address);
                } else {
                    self.declared_failed.insert(reply_address);
                }
            }
        }

        if version > self.current_version {
            // The requester outlived a restart of this server; it must reset.
            return (Err(Error::FutureVersion), change);
        }

        let (interval, timeout) = if sender_status.is_some() {
            (self.knobs.server_request_interval, self.knobs.failure_timeout)
        } else {
            (self.knobs.client_request_interval, self.knobs.client_failure_timeout)
        };

        let mut reply = FailureMonitoringReply {
            failure_information_version: self.current_version,
            client_request_interval_ms: (interval * 1000.0) as u64,
            consider_server_failed_timeout_ms: (timeout * 1000.0) as u64,
            all_others_failed: false,
            changes: Vec::new(),
        };

        let history_len = self.status_history.len() as u64;
        if version == 0 || version < self.current_version - history_len {
            reply.all_others_failed = true;
            reply.changes = self
                .current_status
                .iter()
                .map(|(addr, entry)| SystemFailureStatus::new(*addr, entry.status))
                .collect();
        } else {
            let start = (version + history_len - self.current_version) as usize;
            reply.changes = self.status_history.iter().skip(start).copied().collect();
        }

        (Ok(reply), change)
    }

    /// Declares quiet peers failed. Returns the change-log entries produced.
    fn tick(&mut self, now: f64, stacked_generations: i64) -> Vec<SystemFailureStatus> {
        let mut latencies: Vec<f64> = self
            .current_status
            .values()
            .filter(|e| e.penultimate_request_time > 0.0)
            .map(|e| e.latency(now))
            .collect();

        let mut pivot_delay = 0.0;
        if !latencies.is_empty() {
            let pivot = latencies.len().saturating_sub(2);
            latencies.sort_by(|a, b| a.total_cmp(b));
            pivot_delay = latencies[pivot];
        }
        pivot_delay = (pivot_delay - self.knobs.server_request_interval).max(0.0);

        let emergency = stacked_generations > self.knobs.failure_max_generations;
        let timeout = if emergency {
            self.knobs.failure_emergency_delay
        } else {
            (2.0 * pivot_delay + self.knobs.server_request_interval + self.knobs.failure_min_delay)
                .max(self.knobs.failure_max_delay)
        };

        let local = self.local_address;
        let failed: Vec<SocketAddr> = self
            .current_status
            .iter()
            .filter(|(addr, entry)| **addr != local && now - entry.last_request_time > timeout)
            .map(|(addr, _)| *addr)
            .collect();

        let mut changes = Vec::with_capacity(failed.len());
        for addr in failed {
            warn!(address = %addr, timeout, pivot_delay, emergency, "Peer declared failed");
            self.current_status.remove(&addr);
            self.declared_failed.insert(addr);
            self.record_change(addr, FailureStatus::failed());
            changes.push(SystemFailureStatus::new(addr, FailureStatus::failed()));
        }
        changes
    }

    fn is_available(&self, addr: SocketAddr) -> bool {
        match self.current_status.get(&addr) {
            Some(entry) => entry.status.is_available(),
            None => !self.declared_failed.contains(&addr),
        }
    }
}

/// The failure-detection service hosted by the cluster controller.
///
/// Request handling is synchronous; [`FailureDetector::run`] drives the
/// request stream and the periodic timeout tick. Status changes are fanned
/// out on a broadcast channel so the worker registry can react without
/// polling.
pub struct FailureDetector {
    core: Mutex<DetectorCore>,
    clock: Clock,
    knobs: Arc<Knobs>,
    events: broadcast::Sender<SystemFailureStatus>,
    stacked_generations: AtomicI64,
}

impl FailureDetector {
    /// Creates a detector for the controller at `local_address`.
    pub fn new(local_address: SocketAddr, knobs: Arc<Knobs>, clock: Clock) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            core: Mutex::new(DetectorCore::new(local_address, knobs.clone())),
            clock,
            knobs,
            events,
            stacked_generations: AtomicI64::new(0),
        }
    }

    /// Subscribes to status-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemFailureStatus> {
        self.events.subscribe()
    }

    /// Updates the stacked recovery-generation count that gates the
    /// emergency timeout.
    pub fn set_stacked_generations(&self, generations: i64) {
        self.stacked_generations.store(generations, Ordering::Relaxed);
    }

    /// Handles one monitoring poll.
    pub fn handle(
        &self,
        version: u64,
        sender_status: Option<FailureStatus>,
        reply_address: SocketAddr,
    ) -> Result<FailureMonitoringReply> {
        let now = self.clock.now();
        let (reply, change) = {
            let mut core = self.core.lock();
            core.handle_request(version, sender_status, reply_address, now)
        };
        counter!("helmsman_failure_monitor_requests").increment(1);
        if let Some(change) = change {
            let _ = self.events.send(change);
        }
        reply
    }

    /// Records a status report without producing a reply. Used by the
    /// in-process worker runtime and by tests.
    pub fn report(&self, address: SocketAddr, status: FailureStatus) {
        let now = self.clock.now();
        let change = {
            let mut core = self.core.lock();
            let (_, change) = core.handle_request(0, Some(status), address, now);
            change
        };
        if let Some(change) = change {
            let _ = self.events.send(change);
        }
    }

    /// True when the peer is known and not failed.
    pub fn is_available(&self, addr: SocketAddr) -> bool {
        self.core.lock().is_available(addr)
    }

    /// The current status version.
    pub fn current_version(&self) -> u64 {
        self.core.lock().current_version
    }

    /// Runs one adaptive-timeout pass immediately.
    pub fn run_timeout_pass(&self) {
        let now = self.clock.now();
        let generations = self.stacked_generations.load(Ordering::Relaxed);
        let changes = {
            let mut core = self.core.lock();
            let changes = core.tick(now, generations);
            gauge!("helmsman_failure_monitor_version").set(core.current_version as f64);
            gauge!("helmsman_failure_monitor_peers").set(core.current_status.len() as f64);
            changes
        };
        for change in changes {
            counter!("helmsman_failure_monitor_declared_failed").increment(1);
            let _ = self.events.send(change);
        }
    }

    /// Serves the request stream and the periodic timeout tick until the
    /// stream closes.
    pub async fn run(self: Arc<Self>, mut requests: mpsc::Receiver<FailureMonitoringRequest>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs_f64(
            self.knobs.server_request_interval,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = requests.recv() => {
                    let Some(req) = req else {
                        trace!("Failure-monitoring request stream closed");
                        return;
                    };
                    let reply = self.handle(
                        req.failure_information_version,
                        req.sender_status,
                        req.reply_address,
                    );
                    let _ = req.reply.send(reply);
                }
                _ = tick.tick() => {
                    self.run_timeout_pass();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:4500").parse().unwrap()
    }

    fn core() -> DetectorCore {
        DetectorCore::new(addr(1), Arc::new(Knobs::default()))
    }

    fn poll(core: &mut DetectorCore, from: u8, version: u64, now: f64) -> FailureMonitoringReply {
        core.handle_request(version, Some(FailureStatus::available()), addr(from), now).0.unwrap()
    }

    #[test]
    fn test_versions_monotone() {
        let mut core = core();
        let mut last = 0;
        for i in 2..10 {
            poll(&mut core, i, 0, i as f64);
            assert!(core.current_version >= last);
            last = core.current_version;
        }
    }

    #[test]
    fn test_history_bounded_by_status_size() {
        let mut core = core();
        for i in 2..12 {
            poll(&mut core, i, 0, i as f64);
            assert!(core.status_history.len() <= core.current_status.len());
        }
        core.tick(1000.0, 0);
        assert!(core.status_history.len() <= core.current_status.len());
    }

    #[test]
    fn test_future_version_rejected() {
        let mut core = core();
        let (reply, _) =
            core.handle_request(5, Some(FailureStatus::available()), addr(2), 1.0);
        assert!(matches!(reply, Err(Error::FutureVersion)));
    }

    #[test]
    fn test_stale_requester_gets_snapshot() {
        let mut core = core();
        for i in 2..8 {
            let __version = core.current_version;
            poll(&mut core, i, __version, i as f64);
        }
        // Version 0 always resyncs in full.
        let reply = poll(&mut core, 2, 0, 10.0);
        assert!(reply.all_others_failed);
        assert_eq!(reply.changes.len(), core.current_status.len());
    }

    #[test]
    fn test_delta_slices_by_version() {
        // A server at version 16 with a four-entry history serves nearby
        // requesters delta slices and resyncs anyone further behind in
        // full.
        let mut core = core();
        // Twelve status changes: six arrivals, then six timeouts, then six
        // arrivals again leaves history trimmed to the live peer count.
        for i in 2..8 {
            let __version = core.current_version;
            poll(&mut core, i, __version, 1.0);
        }
        core.tick(100.0, 0);
        assert_eq!(core.current_version, 12);

        for i in 2..6 {
            let __version = core.current_version;
            poll(&mut core, i, __version, 101.0);
        }
        assert_eq!(core.current_version, 16);
        assert_eq!(core.status_history.len(), 4);

        let reply = poll(&mut core, 2, 9, 102.0);
        assert!(reply.all_others_failed);

        let reply = poll(&mut core, 2, 13, 102.0);
        assert!(!reply.all_others_failed);
        assert_eq!(reply.changes.len(), 3);

        let reply = poll(&mut core, 2, 16, 102.0);
        assert!(!reply.all_others_failed);
        assert!(reply.changes.is_empty());
    }

    #[test]
    fn test_delta_apply_matches_view() {
        // Applying a delta slice in order must reproduce the server view.
        let mut core = core();
        for i in 2..7 {
            let __version = core.current_version;
            poll(&mut core, i, __version, 1.0);
        }
        let base_version = core.current_version;
        let mut view: HashMap<SocketAddr, FailureStatus> = core
            .current_status
            .iter()
            .map(|(a, e)| (*a, e.status))
            .collect();

        let __version = core.current_version;
        poll(&mut core, 7, __version, 2.0);
        let __version = core.current_version;
        poll(&mut core, 8, __version, 2.0);

        let reply = poll(&mut core, 2, base_version, 3.0);
        assert!(!reply.all_others_failed);
        for change in &reply.changes {
            if change.status.failed {
                view.remove(&change.address);
            } else {
                view.insert(change.address, change.status);
            }
        }
        let server_view: HashMap<SocketAddr, FailureStatus> =
            core.current_status.iter().map(|(a, e)| (*a, e.status)).collect();
        assert_eq!(view, server_view);
    }

    #[test]
    fn test_quiet_peer_declared_failed() {
        let mut core = core();
        poll(&mut core, 2, 0, 0.0);
        let __version = core.current_version;
        poll(&mut core, 2, __version, 0.5);
        poll(&mut core, 3, 0, 0.5);
        let __version = core.current_version;
        poll(&mut core, 3, __version, 1.0);

        // Within the default max delay nothing fails.
        assert!(core.tick(2.0, 0).is_empty());
        assert!(core.is_available(addr(2)));

        // Long silence fails both peers.
        let changes = core.tick(100.0, 0);
        assert_eq!(changes.len(), 2);
        assert!(!core.is_available(addr(2)));
        assert!(!core.is_available(addr(3)));
    }

    #[test]
    fn test_two_drifting_peers_raise_tolerance() {
        // Two peers with a shared 29-second request gap push the pivot (the
        // second-highest latency) up, so a third peer that has been quiet
        // for 21 seconds is still tolerated.
        let mut core = core();
        for i in [2, 3] {
            poll(&mut core, i, 0, 1.0);
            let __version = core.current_version;
            poll(&mut core, i, __version, 30.0);
        }
        poll(&mut core, 4, 0, 5.0);
        let __version = core.current_version;
        poll(&mut core, 4, __version, 10.0);

        assert!(core.tick(31.0, 0).is_empty());
        assert!(core.is_available(addr(4)));
    }

    #[test]
    fn test_single_slow_peer_does_not_raise_tolerance() {
        // Same shape, but only ONE peer carries the long gap: the pivot
        // tracks the healthy majority, the timeout stays near its floor,
        // and the quiet peer is declared failed.
        let mut core = core();
        for i in [2, 3] {
            poll(&mut core, i, 0, 29.5);
            let __version = core.current_version;
            poll(&mut core, i, __version, 30.0);
        }
        poll(&mut core, 4, 0, 5.0);
        let __version = core.current_version;
        poll(&mut core, 4, __version, 10.0);

        let changes = core.tick(31.0, 0);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].address, addr(4));
        assert!(!core.is_available(addr(4)));
    }

    #[test]
    fn test_emergency_timeout_under_stacked_generations() {
        let knobs = Knobs::default();
        let mut core = core();
        // Both peers share a long request gap, which pushes the adaptive
        // timeout far above their current silence.
        for i in [2, 3] {
            poll(&mut core, i, 0, 1.0);
            let __version = core.current_version;
            poll(&mut core, i, __version, 30.0);
        }
        assert!(core.tick(59.0, 0).is_empty());

        // With too many stacked recovery generations the emergency delay
        // overrides that tolerance to break liveness-destroying loops.
        let changes = core.tick(61.0, knobs.failure_max_generations + 1);
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_local_address_never_declared_failed() {
        let mut core = core();
        core.handle_request(0, Some(FailureStatus::available()), addr(1), 0.0);
        let changes = core.tick(10_000.0, 0);
        assert!(changes.is_empty());
        assert!(core.is_available(addr(1)));
    }

    #[test]
    fn test_client_and_server_knob_selection() {
        let knobs = Knobs::default();
        let mut core = core();
        let server_reply = poll(&mut core, 2, 0, 0.0);
        assert_eq!(
            server_reply.client_request_interval_ms,
            (knobs.server_request_interval * 1000.0) as u64
        );

        let (client_reply, _) = core.handle_request(0, None, addr(3), 0.0);
        let client_reply = client_reply.unwrap();
        assert_eq!(
            client_reply.client_request_interval_ms,
            (knobs.client_request_interval * 1000.0) as u64
        );
        assert_eq!(
            client_reply.consider_server_failed_timeout_ms,
            (knobs.client_failure_timeout * 1000.0) as u64
        );
    }

    #[tokio::test]
    async fn test_async_server_round_trip() {
        let detector = Arc::new(FailureDetector::new(
            addr(1),
            Arc::new(Knobs::default()),
            Clock::new(),
        ));
        let (tx, rx) = mpsc::channel(16);
        let server = tokio::spawn(detector.clone().run(rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(FailureMonitoringRequest {
            failure_information_version: 0,
            sender_status: Some(FailureStatus::available()),
            reply_address: addr(2),
            reply: reply_tx,
        })
        .await
        .unwrap();

        let reply = reply_rx.await.unwrap().unwrap();
        assert_eq!(reply.failure_information_version, 1);
        assert!(detector.is_available(addr(2)));

        drop(tx);
        server.await.unwrap();
    }
}
