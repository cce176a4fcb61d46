//! Operator-tunable constants.
//!
//! All timing constants are seconds. The set is immutable after startup
//! and passed into the controller at construction; nothing reads tunables
//! from global state.

use serde::{Deserialize, Serialize};

use crate::class::Fitness;

/// The knob set consumed by the controller and the failure detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Knobs {
    /// Poll interval the failure-detection server hands to servers.
    pub server_request_interval: f64,
    /// Poll interval the failure-detection server hands to clients.
    pub client_request_interval: f64,
    /// Failure timeout reported to servers.
    pub failure_timeout: f64,
    /// Failure timeout reported to clients.
    pub client_failure_timeout: f64,
    /// Floor added on top of the adaptive pivot delay.
    pub failure_min_delay: f64,
    /// Hard upper bound on the adaptive failure timeout.
    pub failure_max_delay: f64,
    /// Timeout used while too many recovery generations are stacked.
    pub failure_emergency_delay: f64,
    /// Stacked-generation count above which the emergency timeout engages.
    pub failure_max_generations: i64,

    /// Reaction time for master failure once the master has registered.
    pub master_failure_reaction_time: f64,
    /// Slope applied to the reaction time while a recovery is in flight.
    pub master_failure_slope_during_recovery: f64,
    /// Minimum delay between master recruitment attempts.
    pub master_spin_delay: f64,
    /// Delay between recruitment attempts that were not good enough.
    pub attempt_recruitment_delay: f64,
    /// Window during which merely-feasible placements are rejected.
    pub wait_for_good_recruitment_delay: f64,
    /// Same, for remote recruitment, measured from remote start time.
    pub wait_for_good_remote_recruitment_delay: f64,
    /// Period of the outstanding-request / better-placement driver.
    pub check_outstanding_interval: f64,
    /// Deadline for parked storage recruitment requests.
    pub recruitment_timeout: f64,
    /// Failure time applied to worker availability watches.
    pub worker_failure_time: f64,
    /// Reboot hysteresis window.
    pub shutdown_timeout: f64,

    /// Debounce before a datacenter priority change is committed.
    pub cc_change_delay: f64,
    /// Delay between fitness groups while walking workers for a DC change.
    pub cc_class_delay: f64,
    /// Interval of the coordination ping fan-out.
    pub worker_coordination_ping_delay: f64,
    /// Version lag above which failover to a lagging region is avoided.
    pub max_version_difference: i64,
    /// Poll interval of the datacenter version-lag monitor.
    pub version_lag_metric_interval: f64,
    /// Minimum interval between version-lag log lines.
    pub controller_logging_delay: f64,
    /// Long-poll timeout for database-info subscriptions.
    pub dbinfo_poll_timeout: f64,
    /// Retention window for reported incompatible peer addresses.
    pub incompatible_peers_logging_interval: f64,

    /// Expected fitness of a freshly recruited master.
    pub expected_master_fitness: Fitness,
    /// Expected fitness of freshly recruited transaction logs.
    pub expected_tlog_fitness: Fitness,
    /// Expected fitness of freshly recruited proxies.
    pub expected_proxy_fitness: Fitness,
    /// Expected fitness of freshly recruited resolvers.
    pub expected_resolver_fitness: Fitness,
    /// Expected fitness of freshly recruited log routers.
    pub expected_log_router_fitness: Fitness,

    /// Random subset ratings per candidate in the sampled policy search.
    pub policy_rating_tests: u32,
    /// Candidate generations in the sampled policy search.
    pub policy_generations: u32,

    /// Interval between read-version samples written by the time keeper.
    pub time_keeper_delay: f64,
    /// Maximum retained read-version samples.
    pub time_keeper_max_entries: i64,

    /// Backoff for retried system-store transactions.
    pub store_retry_delay: f64,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            server_request_interval: 0.5,
            client_request_interval: 1.0,
            failure_timeout: 1.0,
            client_failure_timeout: 4.0,
            failure_min_delay: 4.0,
            failure_max_delay: 5.0,
            failure_emergency_delay: 30.0,
            failure_max_generations: 10,

            master_failure_reaction_time: 0.4,
            master_failure_slope_during_recovery: 0.1,
            master_spin_delay: 1.0,
            attempt_recruitment_delay: 0.035,
            wait_for_good_recruitment_delay: 1.0,
            wait_for_good_remote_recruitment_delay: 5.0,
            check_outstanding_interval: 0.5,
            recruitment_timeout: 600.0,
            worker_failure_time: 1.0,
            shutdown_timeout: 600.0,

            cc_change_delay: 0.1,
            cc_class_delay: 0.01,
            worker_coordination_ping_delay: 60.0,
            max_version_difference: 20_000_000,
            version_lag_metric_interval: 0.5,
            controller_logging_delay: 5.0,
            dbinfo_poll_timeout: 300.0,
            incompatible_peers_logging_interval: 600.0,

            expected_master_fitness: Fitness::UnsetFit,
            expected_tlog_fitness: Fitness::UnsetFit,
            expected_proxy_fitness: Fitness::UnsetFit,
            expected_resolver_fitness: Fitness::UnsetFit,
            expected_log_router_fitness: Fitness::UnsetFit,

            policy_rating_tests: 200,
            policy_generations: 100,

            time_keeper_delay: 10.0,
            time_keeper_max_entries: 259_200,

            store_retry_delay: 0.5,
        }
    }
}

impl Knobs {
    /// Startup grace window during which every registered worker counts as
    /// available regardless of the failure monitor.
    pub fn availability_grace(&self) -> f64 {
        2.0 * self.server_request_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_express_seconds() {
        let knobs = Knobs::default();
        assert!(knobs.server_request_interval < knobs.client_request_interval);
        assert!(knobs.failure_min_delay < knobs.failure_emergency_delay);
        assert!(knobs.wait_for_good_recruitment_delay < knobs.wait_for_good_remote_recruitment_delay);
        assert_eq!(knobs.availability_grace(), 1.0);
    }
}
