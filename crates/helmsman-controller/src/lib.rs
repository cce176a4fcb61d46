//! The helmsman cluster controller.
//!
//! The controller is the control-plane singleton of a replicated, sharded
//! transactional database. It hosts the failure-detection service, keeps
//! the authoritative worker registry, recruits workers into typed roles
//! under replication-policy constraints, supervises the master, and keeps
//! re-evaluating whether a materially better placement exists.
//!
//! # Architecture
//!
//! One [`controller::Controller`] exists per elected incarnation. Long-
//! lived components (failure detector, master supervisor, class monitor,
//! datacenter priority updater, version-lag monitor, time keeper,
//! outstanding-request checker) run as tasks over it; the top-level loop
//! in [`controller::run_cluster_controller`] dispatches inbound requests
//! and tears everything down when leadership is lost or a component fails.
//!
//! Mutable state lives in [`state::ClusterState`] behind a lock that is
//! never held across an await; all recruitment logic in [`recruit`] and
//! [`better`] is synchronous and deterministic given the registry, the
//! failure-monitor view, and a seeded RNG.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod better;
pub mod class_monitor;
pub mod controller;
pub mod dbinfo;
pub mod dc_priority;
pub mod messages;
pub mod outstanding;
pub mod recruit;
pub mod registry;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod time_keeper;
pub mod version_lag;

pub use controller::{
    controller_channels, run_cluster_controller, Controller, ControllerHandle, ControllerRequests,
};
pub use dbinfo::{ClientDBInfo, LogSet, LogSystemConfig, RecoveryState, ServerDBInfo};
pub use messages::{
    RecruitFromConfigurationReply, RecruitFromConfigurationRequest, RegisterWorkerReply,
    RegisterWorkerRequest, WorkerInterface,
};
pub use recruit::{IdUsed, RecruitCtx, RoleFitness};
pub use state::ClusterState;
pub use store::{MemoryStore, SystemStore};
