//! Process classes, cluster roles, and the fitness lattice.
//!
//! A process declares a class at startup (or has one assigned through the
//! system keyspace); the controller maps `(class, role)` pairs onto an
//! ordinal fitness and always recruits the lowest-fitness workers that
//! still satisfy the replication policy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared specialization of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassType {
    /// No class declared; acceptable for most roles.
    Unset,
    /// Storage server.
    Storage,
    /// Transaction log.
    TLog,
    /// Commit proxy.
    Proxy,
    /// Conflict resolver.
    Resolver,
    /// Recovery master.
    Master,
    /// Stateless transaction-subsystem roles (proxy, resolver, master).
    Stateless,
    /// Cross-region log router.
    LogRouter,
    /// Cluster controller.
    ClusterController,
    /// Workload tester; never recruited into database roles.
    Tester,
}

impl ClassType {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Storage => "storage",
            Self::TLog => "transaction",
            Self::Proxy => "proxy",
            Self::Resolver => "resolution",
            Self::Master => "master",
            Self::Stateless => "stateless",
            Self::LogRouter => "router",
            Self::ClusterController => "cluster_controller",
            Self::Tester => "test",
        }
    }
}

impl fmt::Display for ClassType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a process class came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassSource {
    /// Declared on the process command line.
    CommandLine,
    /// Assigned automatically.
    AutoSet,
    /// Assigned through the system keyspace; overrides the command line.
    Database,
}

/// A class together with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessClass {
    /// The declared class.
    pub class_type: ClassType,
    /// Where the declaration came from.
    pub source: ClassSource,
}

impl ProcessClass {
    /// Creates a process class.
    pub fn new(class_type: ClassType, source: ClassSource) -> Self {
        Self { class_type, source }
    }

    /// An unset command-line class.
    pub fn unset() -> Self {
        Self::new(ClassType::Unset, ClassSource::CommandLine)
    }

    /// Maps this class onto a fitness for the given role.
    ///
    /// Lower is better. `NeverAssign` means the worker must not serve the
    /// role under any circumstance; exclusion clamping happens at the
    /// recruitment sites, not here.
    pub fn role_fitness(&self, role: Role) -> Fitness {
        use ClassType::*;
        use Fitness::*;

        if self.class_type == Tester {
            return NeverAssign;
        }

        match role {
            Role::Storage => match self.class_type {
                Storage => Best,
                Unset => UnsetFit,
                _ => Worst,
            },
            Role::TLog => match self.class_type {
                TLog => Best,
                Unset => UnsetFit,
                _ => Worst,
            },
            Role::Proxy => match self.class_type {
                Proxy => Best,
                Stateless => Good,
                Unset => UnsetFit,
                TLog | Resolver | Master | LogRouter | ClusterController => Okay,
                _ => Worst,
            },
            Role::Resolver => match self.class_type {
                Resolver => Best,
                Stateless => Good,
                Unset => UnsetFit,
                TLog | Proxy | Master | LogRouter | ClusterController => Okay,
                _ => Worst,
            },
            Role::Master => match self.class_type {
                Master => Best,
                Stateless => Good,
                Unset => UnsetFit,
                TLog | Proxy | Resolver | LogRouter | ClusterController => Okay,
                _ => Worst,
            },
            Role::LogRouter => match self.class_type {
                LogRouter => Best,
                Stateless => Good,
                Unset => UnsetFit,
                TLog | Proxy | Resolver | Master | ClusterController => Okay,
                _ => Worst,
            },
            Role::ClusterController => match self.class_type {
                ClusterController => Best,
                Stateless => Good,
                Unset => UnsetFit,
                Master | Proxy | Resolver | LogRouter => Okay,
                _ => Worst,
            },
        }
    }
}

impl Default for ProcessClass {
    fn default() -> Self {
        Self::unset()
    }
}

/// The roles the controller recruits workers into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Recovery master.
    Master,
    /// Commit proxy.
    Proxy,
    /// Conflict resolver.
    Resolver,
    /// Transaction log.
    TLog,
    /// Cross-region log router.
    LogRouter,
    /// Storage server.
    Storage,
    /// Cluster controller.
    ClusterController,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Master => "master",
            Self::Proxy => "proxy",
            Self::Resolver => "resolver",
            Self::TLog => "tlog",
            Self::LogRouter => "log_router",
            Self::Storage => "storage",
            Self::ClusterController => "cluster_controller",
        };
        write!(f, "{s}")
    }
}

/// Ordinal recruitment fitness; lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Fitness {
    /// The role's dedicated class.
    Best,
    /// A closely matching class.
    Good,
    /// No class declared.
    UnsetFit,
    /// Usable but mismatched.
    Okay,
    /// A poor match; only under pressure.
    Worst,
    /// Operator-excluded; only during critical recruitment.
    ExcludeFit,
    /// Must never serve the role.
    NeverAssign,
}

impl Fitness {
    /// Iterates from `Best` up to (and excluding) `NeverAssign`.
    pub fn assignable() -> impl Iterator<Item = Fitness> {
        [
            Fitness::Best,
            Fitness::Good,
            Fitness::UnsetFit,
            Fitness::Okay,
            Fitness::Worst,
            Fitness::ExcludeFit,
        ]
        .into_iter()
    }
}

/// Datacenter preference of a process relative to the controller's
/// desired-datacenter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DcFitness {
    /// In the desired primary datacenter.
    Primary,
    /// In the desired remote datacenter.
    Remote,
    /// Anywhere else, or no preference published.
    Unknown,
}

impl DcFitness {
    /// Ranks `dc` against the published priority list: first entry is the
    /// primary, second is the remote, anything else is unknown.
    pub fn calculate(dc: Option<&crate::types::DcId>, desired: &[Option<crate::types::DcId>]) -> Self {
        match desired.iter().position(|d| d.as_ref() == dc) {
            Some(0) => Self::Primary,
            Some(1) => Self::Remote,
            _ => Self::Unknown,
        }
    }
}

/// Priority information pushed to each worker so it can decide whether to
/// exit and let a better-placed process take over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityInfo {
    /// Fitness of this process for the cluster-controller role.
    pub process_class_fitness: Fitness,
    /// Whether the process address is excluded by configuration.
    pub is_excluded: bool,
    /// Datacenter preference rank.
    pub dc_fitness: DcFitness,
}

impl PriorityInfo {
    /// Creates priority info.
    pub fn new(process_class_fitness: Fitness, is_excluded: bool, dc_fitness: DcFitness) -> Self {
        Self { process_class_fitness, is_excluded, dc_fitness }
    }
}

impl Default for PriorityInfo {
    fn default() -> Self {
        Self::new(Fitness::UnsetFit, false, DcFitness::Unknown)
    }
}
