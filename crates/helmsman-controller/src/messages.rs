//! Request and reply types of the controller's RPC surface.
//!
//! Transport is out of scope: every request is a plain struct carrying a
//! `oneshot` reply sender, delivered to the controller over `mpsc`
//! channels with promise-stream semantics. A dropped reply sender is the
//! wire-level "broken promise".

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use helmsman_core::class::{PriorityInfo, ProcessClass};
use helmsman_core::error::Result;
use helmsman_core::types::{AddressExclusion, DcId, Locality};
use helmsman_detector::health::FailureMetrics;
use helmsman_placement::config::DatabaseConfiguration;

use crate::dbinfo::{
    ClientDBInfo, LogSystemConfig, MasterLifetime, ProxyRef, RecoveryState, ResolverRef,
    ServerDBInfo,
};

/// Addressable endpoints of a worker process.
///
/// Endpoint channels point back at the worker; the registry holds one
/// interface per live process.
#[derive(Debug, Clone)]
pub struct WorkerInterface {
    /// Unique id of this interface instantiation; changes when the worker
    /// process restarts.
    pub id: Uuid,
    /// Network address of the process.
    pub address: SocketAddr,
    /// Declared locality.
    pub locality: Locality,
    /// Endpoint accepting master recruitment.
    pub master: mpsc::Sender<RecruitMasterRequest>,
    /// Endpoint accepting coordination pings.
    pub coordination_ping: mpsc::Sender<CoordinationPing>,
}

/// Worker-side receivers paired with a [`WorkerInterface`].
#[derive(Debug)]
pub struct WorkerEndpoints {
    /// Incoming master recruitment requests.
    pub master: mpsc::Receiver<RecruitMasterRequest>,
    /// Incoming coordination pings.
    pub coordination_ping: mpsc::Receiver<CoordinationPing>,
}

impl WorkerInterface {
    /// Creates an interface and its worker-side endpoints.
    pub fn new(address: SocketAddr, locality: Locality) -> (Self, WorkerEndpoints) {
        let (master_tx, master_rx) = mpsc::channel(16);
        let (ping_tx, ping_rx) = mpsc::channel(64);
        (
            Self {
                id: Uuid::new_v4(),
                address,
                locality,
                master: master_tx,
                coordination_ping: ping_tx,
            },
            WorkerEndpoints { master: master_rx, coordination_ping: ping_rx },
        )
    }
}

impl PartialEq for WorkerInterface {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkerInterface {}

/// The recruited master's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInterface {
    /// Unique id of this master incarnation.
    pub id: Uuid,
    /// Network address.
    pub address: SocketAddr,
    /// Locality of the hosting process.
    pub locality: Locality,
}

/// Asks a worker to start a master with the given lifetime.
#[derive(Debug)]
pub struct RecruitMasterRequest {
    /// Lifetime token the new master must echo in registrations.
    pub lifetime: MasterLifetime,
    /// True when the recovery should forcibly discard unresponsive logs.
    pub force_recovery: bool,
    /// Replies with the started master's interface.
    pub reply: oneshot::Sender<MasterInterface>,
}

/// Periodic controller liveness ping fanned out to every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinationPing {
    /// The controller's id.
    pub controller_id: Uuid,
    /// Monotone step counter.
    pub time_step: u64,
}

/// A worker announcing itself (or re-announcing after a change).
#[derive(Debug)]
pub struct RegisterWorkerRequest {
    /// The worker's endpoints and locality.
    pub interface: WorkerInterface,
    /// Class declared on the command line.
    pub initial_class: ProcessClass,
    /// Class the worker currently believes is effective.
    pub process_class: ProcessClass,
    /// Priority info the worker currently holds.
    pub priority_info: PriorityInfo,
    /// Re-registration counter; newer wins.
    pub generation: u64,
    /// Pushed back only when the derived class or priority differs from
    /// what the worker reported; may be preempted by a newer registration.
    pub reply: oneshot::Sender<RegisterWorkerReply>,
}

/// Corrected class and priority pushed back to a worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterWorkerReply {
    /// Effective class (database override or initial class).
    pub process_class: ProcessClass,
    /// Derived priority info.
    pub priority_info: PriorityInfo,
}

/// Master-issued request for a full role set.
#[derive(Debug)]
pub struct RecruitFromConfigurationRequest {
    /// Configuration to satisfy.
    pub configuration: DatabaseConfiguration,
    /// Also choose seed storage servers for a brand-new database.
    pub recruit_seed_servers: bool,
    /// Log routers needed to serve peeks from prior log generations.
    pub max_old_log_routers: usize,
    /// Replies with the chosen role sets.
    pub reply: oneshot::Sender<Result<RecruitFromConfigurationReply>>,
}

/// Role sets satisfying a recruitment request.
#[derive(Debug, Clone, Default)]
pub struct RecruitFromConfigurationReply {
    /// Datacenter the placement was made in.
    pub dc_id: Option<DcId>,
    /// Transaction logs.
    pub tlogs: Vec<WorkerInterface>,
    /// Satellite transaction logs.
    pub satellite_tlogs: Vec<WorkerInterface>,
    /// Commit proxies.
    pub proxies: Vec<WorkerInterface>,
    /// Resolvers.
    pub resolvers: Vec<WorkerInterface>,
    /// Seed storage servers, when requested.
    pub storage_servers: Vec<WorkerInterface>,
    /// Log routers for prior log generations.
    pub old_log_routers: Vec<WorkerInterface>,
    /// True when the satellite placement used the fallback policy.
    pub satellite_fallback: bool,
}

/// Master-issued request for the remote region's role set.
#[derive(Debug)]
pub struct RecruitRemoteFromConfigurationRequest {
    /// Configuration to satisfy.
    pub configuration: DatabaseConfiguration,
    /// The remote datacenter.
    pub dc_id: DcId,
    /// Desired log-router count.
    pub log_router_count: usize,
    /// Replies with the chosen role sets.
    pub reply: oneshot::Sender<Result<RecruitRemoteFromConfigurationReply>>,
}

/// Remote-region role sets.
#[derive(Debug, Clone, Default)]
pub struct RecruitRemoteFromConfigurationReply {
    /// Remote transaction logs.
    pub remote_tlogs: Vec<WorkerInterface>,
    /// Log routers.
    pub log_routers: Vec<WorkerInterface>,
}

/// Request for a single storage recruit.
#[derive(Debug)]
pub struct RecruitStorageRequest {
    /// Zones that must not be used.
    pub exclude_machines: Vec<String>,
    /// Restrict to these datacenters when non-empty.
    pub include_dcs: Vec<DcId>,
    /// Addresses that must not be used.
    pub exclude_addresses: Vec<AddressExclusion>,
    /// Permit excluded workers when nothing else is left.
    pub critical_recruitment: bool,
    /// Replies with the chosen worker.
    pub reply: oneshot::Sender<Result<RecruitStorageReply>>,
}

/// A single storage recruit.
#[derive(Debug, Clone)]
pub struct RecruitStorageReply {
    /// The chosen worker.
    pub worker: WorkerInterface,
    /// Its effective class.
    pub process_class: ProcessClass,
}

/// The master reporting its current recovery state and role sets.
#[derive(Debug)]
pub struct RegisterMasterRequest {
    /// The registering master's id.
    pub id: Uuid,
    /// The master interface.
    pub interface: MasterInterface,
    /// Current log-system layout.
    pub log_system_config: LogSystemConfig,
    /// Current resolvers.
    pub resolvers: Vec<ResolverRef>,
    /// Current proxies.
    pub proxies: Vec<ProxyRef>,
    /// Recovery progress.
    pub recovery_state: RecoveryState,
    /// Recovery count from the coordinated state.
    pub recovery_count: u64,
    /// Orders registrations from one master; older ones are dropped.
    pub registration_count: u64,
    /// The configuration, once the master has read it.
    pub configuration: Option<DatabaseConfiguration>,
    /// Log servers of the previous generation that must stay locked.
    pub prior_committed_log_servers: Vec<SocketAddr>,
    /// True when the recovery is stalled waiting for a region.
    pub recovery_stalled: bool,
    /// Acknowledged immediately.
    pub reply: oneshot::Sender<()>,
}

/// Registry snapshot request.
#[derive(Debug)]
pub struct GetWorkersRequest {
    /// Skip configuration-excluded processes.
    pub non_excluded_only: bool,
    /// Return only tester-class processes.
    pub tester_only: bool,
    /// Replies with interface/class pairs.
    pub reply: oneshot::Sender<Vec<(WorkerInterface, ProcessClass)>>,
}

/// Client-facing registry snapshot request.
#[derive(Debug)]
pub struct GetClientWorkersRequest {
    /// Replies with the non-tester worker interfaces.
    pub reply: oneshot::Sender<Vec<WorkerInterface>>,
}

/// Long-poll for the server database info.
#[derive(Debug)]
pub struct GetServerDBInfoRequest {
    /// The subscriber's last-seen info id; replies when it changes.
    pub known_server_info_id: Option<Uuid>,
    /// Free-form issue string retained while the poll is open.
    pub issues: String,
    /// Peers the subscriber failed to talk to.
    pub incompatible_peers: Vec<SocketAddr>,
    /// The subscriber's address.
    pub reply_address: SocketAddr,
    /// Replies with the current info.
    pub reply: oneshot::Sender<ServerDBInfo>,
}

/// Long-poll for the client database info.
#[derive(Debug)]
pub struct OpenDatabaseRequest {
    /// The subscriber's last-seen info id; replies when it changes.
    pub known_client_info_id: Option<Uuid>,
    /// Free-form issue string retained while the poll is open.
    pub issues: String,
    /// Client versions supported by the subscriber.
    pub supported_versions: Vec<String>,
    /// Trace log group of the subscriber.
    pub trace_log_group: String,
    /// The subscriber's address.
    pub reply_address: SocketAddr,
    /// Replies with the current client info.
    pub reply: oneshot::Sender<ClientDBInfo>,
}

/// Operator request to force a recovery; only honored before the database
/// accepts commits.
#[derive(Debug)]
pub struct ForceRecoveryRequest {
    /// Acknowledged immediately.
    pub reply: oneshot::Sender<()>,
}

/// A worker publishing its aggregated peer-health metrics.
#[derive(Debug)]
pub struct PublishMetricsRequest {
    /// Latest metrics per peer address.
    pub metrics: HashMap<SocketAddr, FailureMetrics>,
    /// Acknowledged immediately.
    pub reply: oneshot::Sender<()>,
}
