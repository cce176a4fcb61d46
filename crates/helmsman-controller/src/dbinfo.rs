//! Database info broadcast to servers and clients, and the master
//! registration handler that mutates it.

use std::net::SocketAddr;

use tracing::{debug, info};
use uuid::Uuid;

use helmsman_core::types::ProcessId;

use crate::controller::Controller;
use crate::messages::{MasterInterface, RegisterMasterRequest};

/// Recovery progress reported by the master, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecoveryState {
    /// No master has registered yet.
    Uninitialized,
    /// Reading the coordinated state.
    ReadingCoordinatedState,
    /// Locking the coordinated state.
    LockingCoordinatedState,
    /// Recruiting role sets from the controller.
    Recruiting,
    /// Running the recovery transaction.
    RecoveryTransaction,
    /// Writing the coordinated state.
    WritingCoordinatedState,
    /// Commits are accepted; the database is usable.
    AcceptingCommits,
    /// Every configured log (including remote) is recruited.
    AllLogsRecruited,
    /// Storage servers have caught up.
    StorageRecovered,
    /// Recovery fully complete.
    FullyRecovered,
}

/// Binds a master to the controller incarnation that recruited it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterLifetime {
    /// The recruiting controller's id.
    pub controller_id: Uuid,
    /// Bumped on every master recruitment by that controller.
    pub lifetime: u64,
}

impl MasterLifetime {
    /// A lifetime rooted at the given controller.
    pub fn new(controller_id: Uuid) -> Self {
        Self { controller_id, lifetime: 0 }
    }

    /// The next lifetime.
    #[must_use]
    pub fn advanced(mut self) -> Self {
        self.lifetime += 1;
        self
    }
}

/// A transaction log's placement, as reported by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRef {
    /// Hosting process.
    pub process_id: ProcessId,
    /// Network address.
    pub address: SocketAddr,
}

impl LogRef {
    /// Creates a log reference.
    pub fn new(process_id: impl Into<ProcessId>, address: SocketAddr) -> Self {
        Self { process_id: process_id.into(), address }
    }
}

/// A resolver's placement.
pub type ResolverRef = LogRef;
/// A proxy's placement.
pub type ProxyRef = LogRef;

/// One generation-local set of logs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogSet {
    /// True when the set serves the primary region.
    pub is_local: bool,
    /// True when the set holds satellite replicas.
    pub is_satellite: bool,
    /// The logs.
    pub tlogs: Vec<LogRef>,
    /// Log routers attached to this set.
    pub log_routers: Vec<LogRef>,
    /// The replication policy the set was recruited under; used to detect
    /// satellite fallback.
    pub policy: Option<helmsman_placement::policy::ReplicationPolicy>,
}

/// The master's view of the whole log system.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogSystemConfig {
    /// Current log sets.
    pub log_sets: Vec<LogSet>,
    /// Prior log generations still being peeked.
    pub old_log_generations: usize,
}

/// Info broadcast to every server in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDBInfo {
    /// Fresh unique id per publication.
    pub id: Uuid,
    /// The publishing controller.
    pub controller_id: Uuid,
    /// The current master, once recruited.
    pub master: Option<MasterInterface>,
    /// Lifetime of the current master.
    pub master_lifetime: MasterLifetime,
    /// Recovery progress.
    pub recovery_state: RecoveryState,
    /// Log-system layout.
    pub log_system_config: LogSystemConfig,
    /// Current resolvers.
    pub resolvers: Vec<ResolverRef>,
    /// Log servers of the previous generation that must stay locked.
    pub prior_committed_log_servers: Vec<SocketAddr>,
    /// Recovery count from the coordinated state.
    pub recovery_count: u64,
    /// The client-facing slice of this info.
    pub client: ClientDBInfo,
}

impl ServerDBInfo {
    /// Initial info published by a fresh controller.
    pub fn new(controller_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            controller_id,
            master: None,
            master_lifetime: MasterLifetime::new(controller_id),
            recovery_state: RecoveryState::Uninitialized,
            log_system_config: LogSystemConfig::default(),
            resolvers: Vec::new(),
            prior_committed_log_servers: Vec::new(),
            recovery_count: 0,
            client: ClientDBInfo::new(),
        }
    }
}

/// Info broadcast to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientDBInfo {
    /// Fresh unique id per publication.
    pub id: Uuid,
    /// Current proxies.
    pub proxies: Vec<ProxyRef>,
    /// Transaction-sampling rate pushed to clients.
    pub client_txn_info_sample_rate: f64,
    /// Transaction-sampling size limit pushed to clients.
    pub client_txn_info_size_limit: i64,
}

impl ClientDBInfo {
    /// Initial client info.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            proxies: Vec::new(),
            client_txn_info_sample_rate: f64::INFINITY,
            client_txn_info_size_limit: -1,
        }
    }
}

impl Default for ClientDBInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles a master registration: installs the reported recovery state and
/// role sets into the broadcast info, recomputes worker exclusions once a
/// fully-recovered configuration is known, and wakes the outstanding-work
/// checker.
pub fn register_master(controller: &Controller, req: RegisterMasterRequest) {
    let _ = req.reply.send(());

    debug!(
        master = %req.id,
        recovery_state = ?req.recovery_state,
        registration_count = req.registration_count,
        stalled = req.recovery_stalled,
        "Master registration received"
    );

    let mut state = controller.state.write();
    let current = controller.server_info.get();

    // Only the active master may register, and only in order.
    let registered_master = current.master.as_ref().map(|m| m.id);
    if registered_master != Some(req.id)
        || req.registration_count <= state.db.master_registration_count
    {
        debug!(
            master = %req.id,
            registration_count = req.registration_count,
            "Dropping stale master registration"
        );
        return;
    }

    if req.recovery_state == RecoveryState::FullyRecovered {
        state.db.unfinished_recoveries = 0;
        state.db.log_generations = 0;
    } else {
        state.db.log_generations =
            state.db.log_generations.max(req.log_system_config.old_log_generations as i64);
    }
    controller
        .detector
        .set_stacked_generations(state.db.unfinished_recoveries.max(state.db.log_generations));

    state.db.master_registration_count = req.registration_count;
    state.db.recovery_stalled = req.recovery_stalled;

    if let Some(configuration) = req.configuration {
        state.db.config = configuration.clone();

        if req.recovery_state >= RecoveryState::AcceptingCommits {
            state.got_fully_recovered_config = true;
            state.db.fully_recovered_config = Some(configuration.clone());
            for worker in state.id_worker.values_mut() {
                let excluded = configuration.is_excluded_server(worker.interface.address);
                if worker.priority_info.is_excluded != excluded {
                    worker.priority_info.is_excluded = excluded;
                    let reply = crate::messages::RegisterWorkerReply {
                        process_class: worker.process_class,
                        priority_info: worker.priority_info,
                    };
                    worker.reply.send(reply);
                }
            }
        }
    }

    let mut changed = false;
    let mut info = current;

    if info.recovery_state != req.recovery_state {
        info.recovery_state = req.recovery_state;
        changed = true;
    }
    if info.prior_committed_log_servers != req.prior_committed_log_servers {
        info.prior_committed_log_servers = req.prior_committed_log_servers;
        changed = true;
    }

    let client = controller.client_info.get();
    if client.proxies != req.proxies {
        changed = true;
        let mut client = client;
        client.id = Uuid::new_v4();
        client.proxies = req.proxies;
        info!(proxies = client.proxies.len(), id = %client.id, "Publishing new proxy set");
        controller.client_info.set(client.clone());
        info.client = client;
    }

    if info.log_system_config != req.log_system_config {
        info.log_system_config = req.log_system_config;
        changed = true;
    }
    if info.resolvers != req.resolvers {
        info.resolvers = req.resolvers;
        changed = true;
    }
    if info.recovery_count != req.recovery_count {
        info.recovery_count = req.recovery_count;
        changed = true;
    }

    if changed {
        info.id = Uuid::new_v4();
        controller.server_info.set(info);
    }
    drop(state);

    controller.notify_outstanding_check();
}

/// Serves one server-info long-poll: blocks until the info id changes or
/// the poll timeout elapses, tracking the subscriber's issues meanwhile.
pub async fn serve_server_db_info(
    controller: std::sync::Arc<Controller>,
    req: crate::messages::GetServerDBInfoRequest,
) {
    let issue_id = controller.add_worker_issue(req.reply_address, &req.issues);
    {
        let mut state = controller.state.write();
        let expiry = controller.clock.now() + controller.knobs.incompatible_peers_logging_interval;
        for peer in &req.incompatible_peers {
            state.incompatible_connections.insert(*peer, expiry);
        }
    }

    let mut info_rx = controller.server_info.subscribe();
    while Some(controller.server_info.get().id) == req.known_server_info_id {
        tokio::select! {
            _ = info_rx.changed() => {}
            // The subscriber might be long gone; time the poll out.
            _ = crate::controller::delay_jittered(controller.knobs.dbinfo_poll_timeout) => break,
        }
    }

    controller.remove_worker_issue(req.reply_address, &req.issues, issue_id);
    let _ = req.reply.send(controller.server_info.get());
}

/// Serves one client-info long-poll.
pub async fn serve_open_database(
    controller: std::sync::Arc<Controller>,
    req: crate::messages::OpenDatabaseRequest,
) {
    let issue_id = controller.add_client_issue(req.reply_address, &req.issues);
    {
        let mut state = controller.state.write();
        if !req.supported_versions.is_empty() {
            state.client_version_map.insert(req.reply_address, req.supported_versions.clone());
        }
        state.trace_log_group_map.insert(req.reply_address, req.trace_log_group.clone());
    }

    let mut info_rx = controller.client_info.subscribe();
    while Some(controller.client_info.get().id) == req.known_client_info_id {
        tokio::select! {
            _ = info_rx.changed() => {}
            _ = crate::controller::delay_jittered(controller.knobs.dbinfo_poll_timeout) => break,
        }
    }

    controller.remove_client_issue(req.reply_address, &req.issues, issue_id);
    {
        let mut state = controller.state.write();
        state.client_version_map.remove(&req.reply_address);
        state.trace_log_group_map.remove(&req.reply_address);
    }
    let _ = req.reply.send(controller.client_info.get());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_state_order() {
        assert!(RecoveryState::Recruiting < RecoveryState::AcceptingCommits);
        assert!(RecoveryState::AcceptingCommits < RecoveryState::AllLogsRecruited);
        assert!(RecoveryState::AllLogsRecruited < RecoveryState::FullyRecovered);
    }

    #[test]
    fn test_lifetime_advances() {
        let id = Uuid::new_v4();
        let lt = MasterLifetime::new(id);
        let next = lt.advanced();
        assert_eq!(next.lifetime, lt.lifetime + 1);
        assert_eq!(next.controller_id, id);
        assert_ne!(lt, next);
    }
}
