//! Shared controller state.
//!
//! One `ClusterState` exists per controller incarnation, guarded by a
//! short-critical-section lock that is never held across an await. Tasks
//! re-read whatever they need after every suspension point.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::oneshot;
use uuid::Uuid;

use helmsman_core::class::{PriorityInfo, ProcessClass};
use helmsman_core::sync::ReplySlot;
use helmsman_core::types::{DcId, ProcessId};
use helmsman_placement::config::DatabaseConfiguration;

use crate::messages::{
    RecruitFromConfigurationRequest, RecruitRemoteFromConfigurationRequest, RecruitStorageRequest,
    RegisterWorkerReply, WorkerInterface,
};
use crate::store::ProcessData;

/// One registered worker process.
#[derive(Debug)]
pub struct WorkerInfo {
    /// Availability watch task for this interface; aborted on replacement.
    pub watcher: Option<tokio::task::JoinHandle<()>>,
    /// Rewindable reply used to push new priority info to the worker.
    pub reply: ReplySlot<RegisterWorkerReply>,
    /// Registration generation; newer wins.
    pub generation: u64,
    /// Reboots observed inside the hysteresis window.
    pub reboots: i32,
    /// When the worker last became available.
    pub last_available_time: f64,
    /// The worker's endpoints and locality.
    pub interface: WorkerInterface,
    /// Class declared on the command line.
    pub initial_class: ProcessClass,
    /// Currently effective class.
    pub process_class: ProcessClass,
    /// Priority info last derived for the worker.
    pub priority_info: PriorityInfo,
}

impl WorkerInfo {
    /// Aborts the availability watch, if any.
    pub fn abort_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for WorkerInfo {
    fn drop(&mut self) {
        self.abort_watcher();
    }
}

/// Master-registration-sourced database state.
#[derive(Debug)]
pub struct DbData {
    /// Orders registrations from the current master.
    pub master_registration_count: u64,
    /// True while the master reports a stalled recovery.
    pub recovery_stalled: bool,
    /// Passed to the next recruited master to force recovery.
    pub force_recovery: bool,
    /// Configuration reported by the master.
    pub config: DatabaseConfiguration,
    /// Configuration as of the last fully recovered state.
    pub fully_recovered_config: Option<DatabaseConfiguration>,
    /// Recoveries started and not yet fully finished.
    pub unfinished_recoveries: i64,
    /// Old log generations still alive.
    pub log_generations: i64,
}

impl Default for DbData {
    fn default() -> Self {
        Self {
            master_registration_count: 0,
            recovery_stalled: false,
            force_recovery: false,
            config: DatabaseConfiguration::single(),
            fully_recovered_config: None,
            unfinished_recoveries: 0,
            log_generations: 0,
        }
    }
}

/// All mutable controller state.
pub struct ClusterState {
    /// The worker registry, keyed by process id.
    pub id_worker: HashMap<ProcessId, WorkerInfo>,
    /// Class overrides read from the system keyspace.
    pub id_class: HashMap<ProcessId, ProcessClass>,
    /// True once the class overrides have been read at least once.
    pub got_process_classes: bool,
    /// True once a fully recovered configuration has been seen.
    pub got_fully_recovered_config: bool,

    /// Process hosting the current master.
    pub master_process_id: Option<ProcessId>,
    /// Process hosting this controller; set by its own registration.
    pub controller_process_id: Option<ProcessId>,
    /// Datacenter hosting this controller.
    pub controller_dc_id: Option<DcId>,

    /// Recruitments parked on `no_more_servers`.
    pub outstanding_recruitment: Vec<RecruitFromConfigurationRequest>,
    /// Remote recruitments parked on `no_more_servers`.
    pub outstanding_remote: Vec<RecruitRemoteFromConfigurationRequest>,
    /// Storage recruitments with their reply deadlines.
    pub outstanding_storage: Vec<(RecruitStorageRequest, f64)>,

    /// Master-sourced database state.
    pub db: DbData,
    /// Armed by the supervisor; fired by the better-placement evaluator.
    pub force_master_failure: Option<oneshot::Sender<()>>,

    /// Controller start time on the shared clock.
    pub start_time: f64,
    /// When remote recruitment first had its workers available.
    pub remote_start_time: Option<f64>,
    /// Latest primary-to-remote version difference.
    pub datacenter_version_difference: i64,
    /// True when the difference above is current.
    pub version_difference_updated: bool,

    /// Pending worker-list writes, drained by the list writer.
    pub worker_list_delta: HashMap<ProcessId, Option<ProcessData>>,

    /// Open issues reported by workers on their long-polls.
    pub workers_with_issues: HashMap<SocketAddr, (String, Uuid)>,
    /// Open issues reported by clients.
    pub clients_with_issues: HashMap<SocketAddr, (String, Uuid)>,
    /// Reported incompatible peers with retention deadlines.
    pub incompatible_connections: HashMap<SocketAddr, f64>,
    /// Client-supported versions per address, while polls are open.
    pub client_version_map: HashMap<SocketAddr, Vec<String>>,
    /// Client trace log groups per address.
    pub trace_log_group_map: HashMap<SocketAddr, String>,

    /// Shuffle and sampling randomness.
    pub rng: StdRng,
}

impl ClusterState {
    /// Creates state for a controller started at `start_time`.
    pub fn new(start_time: f64) -> Self {
        Self::with_rng(start_time, StdRng::from_os_rng())
    }

    /// Creates state with deterministic randomness.
    pub fn with_rng(start_time: f64, rng: StdRng) -> Self {
        Self {
            id_worker: HashMap::new(),
            id_class: HashMap::new(),
            got_process_classes: false,
            got_fully_recovered_config: false,
            master_process_id: None,
            controller_process_id: None,
            controller_dc_id: None,
            outstanding_recruitment: Vec::new(),
            outstanding_remote: Vec::new(),
            outstanding_storage: Vec::new(),
            db: DbData::default(),
            force_master_failure: None,
            start_time,
            remote_start_time: None,
            datacenter_version_difference: 0,
            version_difference_updated: false,
            worker_list_delta: HashMap::new(),
            workers_with_issues: HashMap::new(),
            clients_with_issues: HashMap::new(),
            incompatible_connections: HashMap::new(),
            client_version_map: HashMap::new(),
            trace_log_group_map: HashMap::new(),
            rng,
        }
    }

    /// Records a worker-list delta for the list writer.
    pub fn set_worker_list(&mut self, id: ProcessId, data: Option<ProcessData>) {
        self.worker_list_delta.insert(id, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state() {
        let state = ClusterState::new(0.0);
        assert!(state.id_worker.is_empty());
        assert!(!state.got_process_classes);
        assert!(state.force_master_failure.is_none());
    }
}
