//! The controller singleton and its top-level event loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use helmsman_core::class::ClassType;
use helmsman_core::error::Result;
use helmsman_core::knobs::Knobs;
use helmsman_core::sync::AsyncVar;
use helmsman_core::types::{Clock, DcId, Locality};
use helmsman_detector::server::{FailureDetector, FailureMonitoringRequest};

use crate::dbinfo::{self, ClientDBInfo, RecoveryState, ServerDBInfo};
use crate::messages::{
    CoordinationPing, ForceRecoveryRequest, GetClientWorkersRequest, GetServerDBInfoRequest,
    GetWorkersRequest, OpenDatabaseRequest, PublishMetricsRequest,
    RecruitFromConfigurationRequest, RecruitRemoteFromConfigurationRequest, RecruitStorageRequest,
    RegisterMasterRequest, RegisterWorkerRequest,
};
use crate::recruit::RecruitCtx;
use crate::state::ClusterState;
use crate::store::SystemStore;
use crate::version_lag::LogMetricsSource;

/// Datacenter priority list: first entry primary, second remote.
pub type DcPriority = Option<Vec<Option<DcId>>>;

/// The cluster controller.
///
/// Long-lived components run as tasks over `Arc<Controller>`; mutable
/// state sits behind a lock that is never held across an await.
pub struct Controller {
    /// This controller incarnation's id.
    pub id: Uuid,
    /// The controller process address.
    pub address: SocketAddr,
    /// The controller process locality.
    pub locality: Locality,
    /// Knob set.
    pub knobs: Arc<Knobs>,
    /// Shared clock.
    pub clock: Clock,
    /// The failure-detection service this controller hosts.
    pub detector: Arc<FailureDetector>,
    /// All mutable controller state.
    pub state: RwLock<ClusterState>,
    /// Info broadcast to servers.
    pub server_info: AsyncVar<ServerDBInfo>,
    /// Info broadcast to clients.
    pub client_info: AsyncVar<ClientDBInfo>,
    /// Desired datacenter priorities.
    pub desired_dc_ids: AsyncVar<DcPriority>,
    /// Priorities being applied first, and whether the controller moves.
    pub changing_dc_ids: AsyncVar<(bool, DcPriority)>,
    /// Priorities applied after the debounce.
    pub changed_dc_ids: AsyncVar<(bool, DcPriority)>,
    /// The system keyspace.
    pub store: Arc<dyn SystemStore>,
    /// Source of log queuing metrics for the version-lag monitor.
    pub log_metrics: Arc<dyn LogMetricsSource>,
    /// Latest peer-health metrics published by workers, per address.
    pub peer_metrics: dashmap::DashMap<SocketAddr, helmsman_detector::health::FailureMetrics>,
    /// Marks the worker list dirty for the list writer.
    pub(crate) worker_list_dirty: AsyncVar<bool>,
    outstanding_notify: Notify,
}

impl Controller {
    /// Creates a controller rooted at the given process.
    pub fn new(
        address: SocketAddr,
        locality: Locality,
        knobs: Arc<Knobs>,
        store: Arc<dyn SystemStore>,
        log_metrics: Arc<dyn LogMetricsSource>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let clock = Clock::new();
        let detector = Arc::new(FailureDetector::new(address, knobs.clone(), clock.clone()));
        let state = ClusterState::new(clock.now());

        Arc::new(Self {
            id,
            address,
            locality,
            knobs,
            clock,
            detector,
            state: RwLock::new(state),
            server_info: AsyncVar::new(ServerDBInfo::new(id)),
            client_info: AsyncVar::new(ClientDBInfo::new()),
            desired_dc_ids: AsyncVar::new(None),
            changing_dc_ids: AsyncVar::new((false, None)),
            changed_dc_ids: AsyncVar::new((false, None)),
            store,
            log_metrics,
            peer_metrics: dashmap::DashMap::new(),
            worker_list_dirty: AsyncVar::new(false),
            outstanding_notify: Notify::new(),
        })
    }

    /// Builds a recruitment context for the current instant.
    pub fn recruit_ctx(&self) -> RecruitCtx<'_> {
        RecruitCtx {
            knobs: &self.knobs,
            detector: &self.detector,
            desired_dc_ids: &self.desired_dc_ids,
            now: self.clock.now(),
        }
    }

    /// Wakes the outstanding-work checker; called after every event that
    /// could change recruitment feasibility.
    pub fn notify_outstanding_check(&self) {
        self.outstanding_notify.notify_one();
    }

    /// Waits for the next outstanding-check wake-up.
    pub(crate) async fn outstanding_notified(&self) {
        self.outstanding_notify.notified().await;
    }

    /// Records a worker-reported issue; empty issues clear the entry.
    pub fn add_worker_issue(&self, addr: SocketAddr, issue: &str) -> Uuid {
        let mut state = self.state.write();
        if issue.is_empty() {
            state.workers_with_issues.remove(&addr);
            return Uuid::nil();
        }
        let id = Uuid::new_v4();
        state.workers_with_issues.insert(addr, (issue.to_string(), id));
        id
    }

    /// Clears a worker issue if it is still the one recorded under `id`.
    pub fn remove_worker_issue(&self, addr: SocketAddr, issue: &str, id: Uuid) {
        if issue.is_empty() {
            return;
        }
        let mut state = self.state.write();
        if state.workers_with_issues.get(&addr).is_some_and(|(_, existing)| *existing == id) {
            state.workers_with_issues.remove(&addr);
        }
    }

    /// Records a client-reported issue; empty issues clear the entry.
    pub fn add_client_issue(&self, addr: SocketAddr, issue: &str) -> Uuid {
        let mut state = self.state.write();
        if issue.is_empty() {
            state.clients_with_issues.remove(&addr);
            return Uuid::nil();
        }
        let id = Uuid::new_v4();
        state.clients_with_issues.insert(addr, (issue.to_string(), id));
        id
    }

    /// Clears a client issue if it is still the one recorded under `id`.
    pub fn remove_client_issue(&self, addr: SocketAddr, issue: &str, id: Uuid) {
        if issue.is_empty() {
            return;
        }
        let mut state = self.state.write();
        if state.clients_with_issues.get(&addr).is_some_and(|(_, existing)| *existing == id) {
            state.clients_with_issues.remove(&addr);
        }
    }
}

/// Sleeps around `secs`, jittered so herds of subscribers do not wake
/// together.
pub async fn delay_jittered(secs: f64) {
    let jitter = 0.9 + 0.2 * rand::random::<f64>();
    tokio::time::sleep(Duration::from_secs_f64(secs * jitter)).await;
}

/// Client-side senders for every controller endpoint.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    /// Worker registration endpoint.
    pub register_worker: mpsc::Sender<RegisterWorkerRequest>,
    /// Full recruitment endpoint.
    pub recruit_from_configuration: mpsc::Sender<RecruitFromConfigurationRequest>,
    /// Remote recruitment endpoint.
    pub recruit_remote_from_configuration: mpsc::Sender<RecruitRemoteFromConfigurationRequest>,
    /// Storage recruitment endpoint.
    pub recruit_storage: mpsc::Sender<RecruitStorageRequest>,
    /// Master registration endpoint.
    pub register_master: mpsc::Sender<RegisterMasterRequest>,
    /// Registry snapshot endpoint.
    pub get_workers: mpsc::Sender<GetWorkersRequest>,
    /// Client registry snapshot endpoint.
    pub get_client_workers: mpsc::Sender<GetClientWorkersRequest>,
    /// Server-info long-poll endpoint.
    pub get_server_db_info: mpsc::Sender<GetServerDBInfoRequest>,
    /// Client-info long-poll endpoint.
    pub open_database: mpsc::Sender<OpenDatabaseRequest>,
    /// Forced-recovery endpoint.
    pub force_recovery: mpsc::Sender<ForceRecoveryRequest>,
    /// Peer-health publication endpoint.
    pub publish_metrics: mpsc::Sender<PublishMetricsRequest>,
    /// Failure-monitoring endpoint.
    pub failure_monitoring: mpsc::Sender<FailureMonitoringRequest>,
}

/// Controller-side receivers for every endpoint.
pub struct ControllerRequests {
    pub(crate) register_worker: mpsc::Receiver<RegisterWorkerRequest>,
    pub(crate) recruit_from_configuration: mpsc::Receiver<RecruitFromConfigurationRequest>,
    pub(crate) recruit_remote_from_configuration:
        mpsc::Receiver<RecruitRemoteFromConfigurationRequest>,
    pub(crate) recruit_storage: mpsc::Receiver<RecruitStorageRequest>,
    pub(crate) register_master: mpsc::Receiver<RegisterMasterRequest>,
    pub(crate) get_workers: mpsc::Receiver<GetWorkersRequest>,
    pub(crate) get_client_workers: mpsc::Receiver<GetClientWorkersRequest>,
    pub(crate) get_server_db_info: mpsc::Receiver<GetServerDBInfoRequest>,
    pub(crate) open_database: mpsc::Receiver<OpenDatabaseRequest>,
    pub(crate) force_recovery: mpsc::Receiver<ForceRecoveryRequest>,
    pub(crate) publish_metrics: mpsc::Receiver<PublishMetricsRequest>,
    pub(crate) failure_monitoring: mpsc::Receiver<FailureMonitoringRequest>,
}

/// Creates the paired handle and receiver set for one controller.
pub fn controller_channels() -> (ControllerHandle, ControllerRequests) {
    let (register_worker_tx, register_worker_rx) = mpsc::channel(128);
    let (recruit_tx, recruit_rx) = mpsc::channel(16);
    let (recruit_remote_tx, recruit_remote_rx) = mpsc::channel(16);
    let (recruit_storage_tx, recruit_storage_rx) = mpsc::channel(64);
    let (register_master_tx, register_master_rx) = mpsc::channel(16);
    let (get_workers_tx, get_workers_rx) = mpsc::channel(16);
    let (get_client_workers_tx, get_client_workers_rx) = mpsc::channel(16);
    let (get_server_db_info_tx, get_server_db_info_rx) = mpsc::channel(128);
    let (open_database_tx, open_database_rx) = mpsc::channel(128);
    let (force_recovery_tx, force_recovery_rx) = mpsc::channel(4);
    let (publish_metrics_tx, publish_metrics_rx) = mpsc::channel(64);
    let (failure_monitoring_tx, failure_monitoring_rx) = mpsc::channel(256);

    (
        ControllerHandle {
            register_worker: register_worker_tx,
            recruit_from_configuration: recruit_tx,
            recruit_remote_from_configuration: recruit_remote_tx,
            recruit_storage: recruit_storage_tx,
            register_master: register_master_tx,
            get_workers: get_workers_tx,
            get_client_workers: get_client_workers_tx,
            get_server_db_info: get_server_db_info_tx,
            open_database: open_database_tx,
            force_recovery: force_recovery_tx,
            publish_metrics: publish_metrics_tx,
            failure_monitoring: failure_monitoring_tx,
        },
        ControllerRequests {
            register_worker: register_worker_rx,
            recruit_from_configuration: recruit_rx,
            recruit_remote_from_configuration: recruit_remote_rx,
            recruit_storage: recruit_storage_rx,
            register_master: register_master_rx,
            get_workers: get_workers_rx,
            get_client_workers: get_client_workers_rx,
            get_server_db_info: get_server_db_info_rx,
            open_database: open_database_rx,
            force_recovery: force_recovery_rx,
            publish_metrics: publish_metrics_rx,
            failure_monitoring: failure_monitoring_rx,
        },
    )
}

fn end_role(id: Uuid, reason: &str, ok: bool) {
    if ok {
        info!(controller = %id, reason, "Cluster controller role ended");
    } else {
        error!(controller = %id, reason, "Cluster controller role ended with error");
    }
}

fn handle_get_workers(controller: &Controller, req: GetWorkersRequest) {
    let state = controller.state.read();
    let workers = state
        .id_worker
        .values()
        .filter(|w| {
            !(req.non_excluded_only && state.db.config.is_excluded_server(w.interface.address))
        })
        .filter(|w| !req.tester_only || w.process_class.class_type == ClassType::Tester)
        .map(|w| (w.interface.clone(), w.process_class))
        .collect();
    let _ = req.reply.send(workers);
}

fn handle_get_client_workers(controller: &Controller, req: GetClientWorkersRequest) {
    let state = controller.state.read();
    let workers = state
        .id_worker
        .values()
        .filter(|w| w.process_class.class_type != ClassType::Tester)
        .map(|w| w.interface.clone())
        .collect();
    let _ = req.reply.send(workers);
}

fn handle_force_recovery(controller: &Controller, req: ForceRecoveryRequest) {
    let recovery_state = controller.server_info.get().recovery_state;
    {
        let mut state = controller.state.write();
        if state.db.master_registration_count == 0
            || recovery_state <= RecoveryState::Recruiting
        {
            if let Some(tx) = state.force_master_failure.take() {
                state.db.force_recovery = true;
                info!("Forcing recovery on operator request");
                let _ = tx.send(());
            }
        }
    }
    let _ = req.reply.send(());
}

fn handle_publish_metrics(controller: &Controller, req: PublishMetricsRequest) {
    for (addr, metrics) in req.metrics {
        controller.peer_metrics.insert(addr, metrics);
    }
    let _ = req.reply.send(());
}

async fn coordination_ping_loop(controller: Arc<Controller>) -> Result<()> {
    let mut step: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs_f64(
        controller.knobs.worker_coordination_ping_delay,
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let message = CoordinationPing { controller_id: controller.id, time_step: step };
        step += 1;
        let pings: Vec<mpsc::Sender<CoordinationPing>> = {
            let state = controller.state.read();
            state.id_worker.values().map(|w| w.interface.coordination_ping.clone()).collect()
        };
        for ping in pings {
            let _ = ping.try_send(message);
        }
        debug!(time_step = message.time_step, "Coordination ping sent");
    }
}

/// Runs the controller until leadership is lost, the interface closes, or
/// a component fails fatally. Always returns cleanly so the process can
/// stand for election again.
pub async fn run_cluster_controller(
    controller: Arc<Controller>,
    mut requests: ControllerRequests,
    mut leader_fail: oneshot::Receiver<()>,
) -> Result<()> {
    info!(controller = %controller.id, address = %controller.address, "Cluster controller core started");

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    {
        let detector = controller.detector.clone();
        let failure_requests = requests.failure_monitoring;
        tasks.spawn(async move {
            detector.run(failure_requests).await;
            Ok(())
        });
    }
    tasks.spawn(crate::supervisor::cluster_watch_database(controller.clone()));
    tasks.spawn(crate::registry::update_worker_list(controller.clone()));
    tasks.spawn(crate::outstanding::check_outstanding_loop(controller.clone()));
    tasks.spawn(crate::class_monitor::monitor_process_classes(controller.clone()));
    tasks.spawn(crate::class_monitor::monitor_client_txn_configs(controller.clone()));
    tasks.spawn(crate::dc_priority::updated_changing_datacenters(controller.clone()));
    tasks.spawn(crate::dc_priority::updated_changed_datacenters(controller.clone()));
    tasks.spawn(crate::version_lag::update_datacenter_version_difference(controller.clone()));
    tasks.spawn(crate::time_keeper::time_keeper(controller.clone()));
    tasks.spawn(coordination_ping_loop(controller.clone()));

    loop {
        tokio::select! {
            Some(finished) = tasks.join_next() => {
                match finished {
                    Ok(Ok(())) => {
                        end_role(controller.id, "component stopped", true);
                        return Ok(());
                    }
                    Ok(Err(err)) => {
                        end_role(controller.id, &err.to_string(), false);
                        // Shut down normally even on serious errors so this
                        // process may be re-elected.
                        return Ok(());
                    }
                    Err(join_err) if join_err.is_cancelled() => {}
                    Err(join_err) => {
                        end_role(controller.id, &join_err.to_string(), false);
                        return Ok(());
                    }
                }
            }
            Some(req) = requests.register_worker.recv() => {
                crate::registry::register_worker(&controller, req);
            }
            Some(req) = requests.recruit_from_configuration.recv() => {
                tasks.spawn(crate::outstanding::recruit_from_configuration(controller.clone(), req));
            }
            Some(req) = requests.recruit_remote_from_configuration.recv() => {
                tasks.spawn(crate::outstanding::recruit_remote_from_configuration(controller.clone(), req));
            }
            Some(req) = requests.recruit_storage.recv() => {
                crate::outstanding::recruit_storage(&controller, req);
            }
            Some(req) = requests.register_master.recv() => {
                dbinfo::register_master(&controller, req);
            }
            Some(req) = requests.get_workers.recv() => {
                handle_get_workers(&controller, req);
            }
            Some(req) = requests.get_client_workers.recv() => {
                handle_get_client_workers(&controller, req);
            }
            Some(req) = requests.get_server_db_info.recv() => {
                let c = controller.clone();
                tasks.spawn(async move {
                    dbinfo::serve_server_db_info(c, req).await;
                    Ok(())
                });
            }
            Some(req) = requests.open_database.recv() => {
                let c = controller.clone();
                tasks.spawn(async move {
                    dbinfo::serve_open_database(c, req).await;
                    Ok(())
                });
            }
            Some(req) = requests.force_recovery.recv() => {
                handle_force_recovery(&controller, req);
            }
            Some(req) = requests.publish_metrics.recv() => {
                handle_publish_metrics(&controller, req);
            }
            _ = &mut leader_fail => {
                end_role(controller.id, "leader replaced", true);
                return Ok(());
            }
        }
    }
}
