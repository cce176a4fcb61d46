//! Database configuration: replication factors, desired role counts, and
//! region topology.
//!
//! The configuration arrives at the controller through master registration
//! and drives every recruitment decision. It is a plain value: the
//! controller never persists it itself.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use helmsman_core::types::{AddressExclusion, DcId};

use crate::policy::ReplicationPolicy;

/// A satellite datacenter attached to a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteInfo {
    /// The satellite datacenter.
    pub dc_id: DcId,
    /// Relative preference among this region's satellites.
    pub priority: i32,
}

/// One region of the cluster: a primary datacenter plus optional satellite
/// datacenters holding extra log replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    /// The region's primary datacenter.
    pub dc_id: DcId,
    /// Region priority; negative regions are never recruited into.
    pub priority: i32,
    /// Satellite datacenters, in preference order.
    pub satellites: Vec<SatelliteInfo>,
    /// Replication policy for satellite logs.
    pub satellite_tlog_policy: Option<ReplicationPolicy>,
    /// Weaker policy engaged when the primary policy is infeasible.
    pub satellite_tlog_policy_fallback: Option<ReplicationPolicy>,
    /// Satellite log replication factor.
    pub satellite_tlog_replication_factor: usize,
    /// Fallback satellite log replication factor.
    pub satellite_tlog_replication_factor_fallback: usize,
    /// How many satellite datacenters are recruited into at once.
    pub satellite_tlog_usable_dcs: usize,
    /// Usable satellite datacenters under the fallback policy.
    pub satellite_tlog_usable_dcs_fallback: usize,
}

impl RegionInfo {
    /// A region with no satellites.
    pub fn new(dc_id: impl Into<DcId>, priority: i32) -> Self {
        Self {
            dc_id: dc_id.into(),
            priority,
            satellites: Vec::new(),
            satellite_tlog_policy: None,
            satellite_tlog_policy_fallback: None,
            satellite_tlog_replication_factor: 0,
            satellite_tlog_replication_factor_fallback: 0,
            satellite_tlog_usable_dcs: 0,
            satellite_tlog_usable_dcs_fallback: 0,
        }
    }
}

/// The dynamic cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfiguration {
    /// Region topology; empty means datacenter-oblivious placement.
    pub regions: Vec<RegionInfo>,
    /// How many regions actively serve reads and hold full replicas.
    pub usable_regions: usize,

    /// Required transaction-log replication factor.
    pub tlog_replication_factor: usize,
    /// Desired transaction-log count (>= the replication factor).
    pub desired_logs: usize,
    /// Desired commit-proxy count.
    pub desired_proxies: usize,
    /// Desired resolver count.
    pub desired_resolvers: usize,
    /// Desired log-router count across the remote region.
    pub desired_log_router_count: usize,
    /// Desired satellite-log count per region.
    pub desired_satellite_logs: usize,
    /// Remote-region log replication factor.
    pub remote_tlog_replication_factor: usize,
    /// Desired remote-region log count.
    pub desired_remote_logs: usize,

    /// Transaction-log replication policy.
    pub tlog_policy: ReplicationPolicy,
    /// Remote-region log replication policy.
    pub remote_tlog_policy: ReplicationPolicy,
    /// Seed storage-server replication policy.
    pub storage_policy: ReplicationPolicy,

    /// Operator-excluded addresses; never recruited.
    pub excluded_servers: Vec<AddressExclusion>,
}

impl DatabaseConfiguration {
    /// Single-replica configuration, the smallest that can run.
    pub fn single() -> Self {
        Self {
            regions: Vec::new(),
            usable_regions: 1,
            tlog_replication_factor: 1,
            desired_logs: 1,
            desired_proxies: 1,
            desired_resolvers: 1,
            desired_log_router_count: 1,
            desired_satellite_logs: 1,
            remote_tlog_replication_factor: 1,
            desired_remote_logs: 1,
            tlog_policy: ReplicationPolicy::One,
            remote_tlog_policy: ReplicationPolicy::One,
            storage_policy: ReplicationPolicy::One,
            excluded_servers: Vec::new(),
        }
    }

    /// Triple-redundancy configuration spread across zones.
    pub fn triple() -> Self {
        Self {
            tlog_replication_factor: 3,
            desired_logs: 3,
            desired_proxies: 2,
            desired_resolvers: 1,
            tlog_policy: ReplicationPolicy::across_zones(3),
            remote_tlog_policy: ReplicationPolicy::across_zones(3),
            storage_policy: ReplicationPolicy::across_zones(3),
            ..Self::single()
        }
    }

    /// True when `addr` is covered by an exclusion entry.
    pub fn is_excluded_server(&self, addr: SocketAddr) -> bool {
        self.excluded_servers.iter().any(|e| e.excludes(addr))
    }

    /// The region whose primary datacenter is `dc`, if any.
    pub fn region_for(&self, dc: &DcId) -> Option<&RegionInfo> {
        self.regions.iter().find(|r| &r.dc_id == dc)
    }

    /// Desired satellite-log count for the region rooted at `dc`.
    pub fn desired_satellite_logs_for(&self, _dc: &DcId) -> usize {
        self.desired_satellite_logs
    }
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self::single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_lookup() {
        let addr: SocketAddr = "10.1.1.1:4500".parse().unwrap();
        let mut conf = DatabaseConfiguration::triple();
        assert!(!conf.is_excluded_server(addr));

        conf.excluded_servers.push(AddressExclusion::address(addr));
        assert!(conf.is_excluded_server(addr));
        assert!(!conf.is_excluded_server("10.1.1.2:4500".parse().unwrap()));
    }

    #[test]
    fn test_region_lookup() {
        let mut conf = DatabaseConfiguration::triple();
        conf.regions.push(RegionInfo::new("east", 1));
        conf.regions.push(RegionInfo::new("west", 0));

        assert_eq!(conf.region_for(&DcId::new("west")).unwrap().priority, 0);
        assert!(conf.region_for(&DcId::new("north")).is_none());
    }

    #[test]
    fn test_triple_defaults() {
        let conf = DatabaseConfiguration::triple();
        assert_eq!(conf.tlog_replication_factor, 3);
        assert_eq!(conf.tlog_policy.min_replicas(), 3);
    }
}
