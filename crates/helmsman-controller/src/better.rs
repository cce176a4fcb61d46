//! The better-placement evaluator.
//!
//! Compares the placement reported by the most recent master registration
//! against a hypothetical fresh recruitment over the same configuration,
//! and decides whether forcing a failover would materially improve the
//! cluster.

use std::collections::HashSet;
use std::net::SocketAddr;

use tracing::{debug, info};

use helmsman_core::class::{Fitness, ProcessClass, Role};

use crate::dbinfo::{RecoveryState, ServerDBInfo};
use crate::recruit::{IdUsed, RecruitCtx, RoleFitness};
use crate::state::ClusterState;

impl ClusterState {
    /// When a recovery is stalled with two regions configured, probe
    /// whether flipping the regions (controller's region first) would
    /// unstick it.
    pub fn check_recovery_stalled(&mut self, ctx: &RecruitCtx<'_>, dbi: &ServerDBInfo) {
        let in_window = matches!(
            dbi.recovery_state,
            RecoveryState::Recruiting
                | RecoveryState::AcceptingCommits
                | RecoveryState::AllLogsRecruited
        );
        if !in_window || !self.db.recovery_stalled {
            return;
        }
        if self.db.config.regions.len() > 1 && self.controller_dc_id.is_some() {
            let mut regions = [self.db.config.regions[0].clone(), self.db.config.regions[1].clone()];
            if self.controller_dc_id.as_ref() == Some(&regions[0].dc_id) {
                regions.swap(0, 1);
            }
            self.check_regions(ctx, &regions);
        }
    }

    /// True when a failover would produce a materially better placement.
    pub fn better_master_exists(&mut self, ctx: &RecruitCtx<'_>, dbi: &ServerDBInfo) -> bool {
        if dbi.recovery_state < RecoveryState::AcceptingCommits {
            return false;
        }

        // An excluded controller is about to move anyway; the master will
        // change with it.
        let Some(controller_process) = self.controller_process_id.clone() else {
            return false;
        };
        if self
            .id_worker
            .get(&controller_process)
            .is_some_and(|w| w.priority_info.is_excluded)
        {
            return false;
        }

        if self.db.config.regions.len() > 1
            && self.controller_dc_id.is_some()
            && self.db.config.regions[0].priority > self.db.config.regions[1].priority
            && self.controller_dc_id.as_ref() != Some(&self.db.config.regions[0].dc_id)
            && self.version_difference_updated
            && self.datacenter_version_difference < ctx.knobs.max_version_difference
        {
            let regions = self.db.config.regions.clone();
            self.check_regions(ctx, &regions);
        }

        let Some(master) = dbi.master.as_ref() else {
            return false;
        };
        if !self.id_worker.contains_key(&master.locality.process_id) {
            return false;
        }

        // Classify the current log placement; any excluded member forces a
        // failover outright, even when the set is under strength.
        let mut tlogs: Vec<ProcessClass> = Vec::new();
        let mut satellite_tlogs: Vec<ProcessClass> = Vec::new();
        let mut remote_tlogs: Vec<ProcessClass> = Vec::new();
        let mut log_routers: Vec<ProcessClass> = Vec::new();
        let mut log_router_addresses: HashSet<SocketAddr> = HashSet::new();

        for log_set in &dbi.log_system_config.log_sets {
            for log in &log_set.tlogs {
                let Some(worker) = self.id_worker.get(&log.process_id) else {
                    return false;
                };
                if worker.priority_info.is_excluded {
                    return true;
                }
                if log_set.is_local && log_set.is_satellite {
                    satellite_tlogs.push(worker.process_class);
                } else if log_set.is_local {
                    tlogs.push(worker.process_class);
                } else {
                    remote_tlogs.push(worker.process_class);
                }
            }
            for router in &log_set.log_routers {
                let Some(worker) = self.id_worker.get(&router.process_id) else {
                    return false;
                };
                if worker.priority_info.is_excluded {
                    return true;
                }
                if log_router_addresses.insert(worker.interface.address) {
                    log_routers.push(worker.process_class);
                }
            }
        }

        let mut proxy_classes: Vec<ProcessClass> = Vec::new();
        for proxy in &dbi.client.proxies {
            let Some(worker) = self.id_worker.get(&proxy.process_id) else {
                return false;
            };
            if worker.priority_info.is_excluded {
                return true;
            }
            proxy_classes.push(worker.process_class);
        }
        let mut resolver_classes: Vec<ProcessClass> = Vec::new();
        for resolver in &dbi.resolvers {
            let Some(worker) = self.id_worker.get(&resolver.process_id) else {
                return false;
            };
            if worker.priority_info.is_excluded {
                return true;
            }
            resolver_classes.push(worker.process_class);
        }

        let conf = self.db.config.clone();

        // Master fitness. An excluded master is clamped rather than
        // short-circuited: when everything is excluded we still need one.
        let master_worker = &self.id_worker[&master.locality.process_id];
        let mut old_master_fit = master_worker.process_class.role_fitness(Role::Master);
        if conf.is_excluded_server(master.address) {
            old_master_fit = old_master_fit.max(Fitness::ExcludeFit);
        }
        let master_on_controller = master.locality.process_id == controller_process;

        let mut id_used = IdUsed::new();
        *id_used.entry(controller_process.clone()).or_default() += 1;
        let controller_dc = self.controller_dc_id.clone();
        let Ok(new_master) = self.get_worker_for_role_in_datacenter(
            ctx,
            controller_dc.as_ref(),
            Role::Master,
            Fitness::NeverAssign,
            &conf,
            &mut id_used,
            true,
        ) else {
            return false;
        };

        if old_master_fit < new_master.fitness {
            return false;
        }
        let new_master_on_controller =
            new_master.worker.0.locality.process_id == controller_process;
        if old_master_fit > new_master.fitness
            || (master_on_controller && !new_master_on_controller)
        {
            info!(
                old_fit = ?old_master_fit,
                new_fit = ?new_master.fitness,
                "A better master placement exists"
            );
            return true;
        }

        // Region context for the log comparisons.
        let mut primary_dc = Vec::new();
        let mut remote_dc = Vec::new();
        let mut region = None;
        if !conf.regions.is_empty() {
            if let Some(cc_dc) = controller_dc.clone() {
                primary_dc.push(cc_dc.clone());
                for r in &conf.regions {
                    if r.dc_id != cc_dc {
                        remote_dc.push(r.dc_id.clone());
                    } else {
                        region = Some(r.clone());
                    }
                }
            }
        }

        let old_tlog_fit = RoleFitness::of_classes(&tlogs, Role::TLog);
        let Ok(new_tlogs) = self.get_workers_for_tlogs(
            ctx,
            &conf,
            conf.tlog_replication_factor,
            conf.desired_logs,
            &conf.tlog_policy,
            &mut id_used,
            true,
            &primary_dc,
        ) else {
            return false;
        };
        let new_tlog_fit = RoleFitness::of_workers(&new_tlogs, Role::TLog);
        if old_tlog_fit.is_better_than(&new_tlog_fit) {
            return false;
        }

        // Satellite comparison, including fallback transitions.
        let old_satellite_fallback = dbi
            .log_system_config
            .log_sets
            .iter()
            .find(|set| set.is_local && set.is_satellite)
            .is_some_and(|set| {
                region.as_ref().is_some_and(|r| {
                    set.policy.is_some() && set.policy != r.satellite_tlog_policy
                })
            });

        let old_satellite_fit = RoleFitness::of_classes(&satellite_tlogs, Role::TLog);
        let mut new_satellite_fallback = false;
        let new_satellite_fit = match region
            .as_ref()
            .filter(|r| r.satellite_tlog_replication_factor > 0)
        {
            Some(r) => {
                let r = r.clone();
                match self.get_workers_for_satellite_logs(
                    ctx,
                    &conf,
                    &r,
                    &mut id_used,
                    &mut new_satellite_fallback,
                    true,
                ) {
                    Ok(workers) => RoleFitness::of_workers(&workers, Role::TLog),
                    Err(_) => return false,
                }
            }
            None => old_satellite_fit,
        };
        if old_satellite_fit.is_better_than(&new_satellite_fit) {
            return false;
        }
        if !old_satellite_fallback && new_satellite_fallback {
            return false;
        }

        let fully_replicated =
            conf.usable_regions > 1 && dbi.recovery_state == RecoveryState::FullyRecovered;

        let old_remote_fit = RoleFitness::of_classes(&remote_tlogs, Role::TLog);
        let new_remote_fit = if fully_replicated {
            match self.get_workers_for_tlogs(
                ctx,
                &conf,
                conf.remote_tlog_replication_factor,
                conf.desired_remote_logs,
                &conf.remote_tlog_policy,
                &mut id_used,
                true,
                &remote_dc,
            ) {
                Ok(workers) => RoleFitness::of_workers(&workers, Role::TLog),
                Err(_) => return false,
            }
        } else {
            old_remote_fit
        };
        if old_remote_fit.is_better_than(&new_remote_fit) {
            return false;
        }

        // Router counts derive from the recruited log counts so the
        // comparison stays consistent with a feasible plan.
        let router_count = |log_count: usize| {
            log_count * 1.max(conf.desired_log_router_count / 1.max(log_count))
        };
        let old_router_count = router_count(old_tlog_fit.count);
        let new_router_count = router_count(new_tlog_fit.count);

        let mut old_log_routers_fit = RoleFitness::of_classes(&log_routers, Role::LogRouter);
        let mut new_log_routers_fit = if fully_replicated {
            let routers = self.get_workers_for_role_in_datacenter(
                ctx,
                remote_dc.first(),
                Role::LogRouter,
                new_router_count,
                &conf,
                &mut id_used,
                None,
                true,
            );
            RoleFitness::of_workers(&routers, Role::LogRouter)
        } else {
            old_log_routers_fit
        };

        if old_log_routers_fit.count < old_router_count {
            old_log_routers_fit.worst_fit = Fitness::NeverAssign;
        }
        if new_log_routers_fit.count < new_router_count {
            new_log_routers_fit.worst_fit = Fitness::NeverAssign;
        }
        if old_log_routers_fit.is_better_than(&new_log_routers_fit) {
            return false;
        }

        // Transaction-subsystem comparison.
        let old_in_fit = RoleFitness::combine(
            RoleFitness::of_classes(&proxy_classes, Role::Proxy),
            RoleFitness::of_classes(&resolver_classes, Role::Resolver),
        );

        let Ok(first_resolver) = self.get_worker_for_role_in_datacenter(
            ctx,
            controller_dc.as_ref(),
            Role::Resolver,
            Fitness::ExcludeFit,
            &conf,
            &mut id_used,
            true,
        ) else {
            return false;
        };
        let Ok(first_proxy) = self.get_worker_for_role_in_datacenter(
            ctx,
            controller_dc.as_ref(),
            Role::Proxy,
            Fitness::ExcludeFit,
            &conf,
            &mut id_used,
            true,
        ) else {
            return false;
        };
        let mut proxies = self.get_workers_for_role_in_datacenter(
            ctx,
            controller_dc.as_ref(),
            Role::Proxy,
            conf.desired_proxies.saturating_sub(1),
            &conf,
            &mut id_used,
            Some(&first_proxy),
            true,
        );
        let mut resolvers = self.get_workers_for_role_in_datacenter(
            ctx,
            controller_dc.as_ref(),
            Role::Resolver,
            conf.desired_resolvers.saturating_sub(1),
            &conf,
            &mut id_used,
            Some(&first_resolver),
            true,
        );
        proxies.push(first_proxy.worker);
        resolvers.push(first_resolver.worker);

        let new_in_fit = RoleFitness::combine(
            RoleFitness::of_workers(&proxies, Role::Proxy),
            RoleFitness::of_workers(&resolvers, Role::Resolver),
        );
        if old_in_fit.better_fitness(&new_in_fit) {
            return false;
        }

        let strictly_better = new_tlog_fit.is_better_than(&old_tlog_fit)
            || new_in_fit.is_better_than(&old_in_fit)
            || (old_satellite_fallback && !new_satellite_fallback)
            || new_satellite_fit.is_better_than(&old_satellite_fit)
            || new_remote_fit.is_better_than(&old_remote_fit)
            || new_log_routers_fit.is_better_than(&old_log_routers_fit);

        if strictly_better {
            info!(
                old_tlog = ?old_tlog_fit,
                new_tlog = ?new_tlog_fit,
                old_in = ?old_in_fit,
                new_in = ?new_in_fit,
                old_satellite = ?old_satellite_fit,
                new_satellite = ?new_satellite_fit,
                old_remote = ?old_remote_fit,
                new_remote = ?new_remote_fit,
                old_routers = ?old_log_routers_fit,
                new_routers = ?new_log_routers_fit,
                old_satellite_fallback,
                new_satellite_fallback,
                "A better placement exists"
            );
            return true;
        }

        debug!("Current placement is as good as a fresh recruitment");
        false
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::Uuid;

    use helmsman_core::class::{ClassSource, ClassType, PriorityInfo, ProcessClass};
    use helmsman_core::knobs::Knobs;
    use helmsman_core::sync::{AsyncVar, ReplySlot};
    use helmsman_core::types::{AddressExclusion, Clock, DcId, Locality, ProcessId};
    use helmsman_detector::server::FailureDetector;
    use helmsman_placement::config::DatabaseConfiguration;

    use crate::dbinfo::{LogRef, LogSet, MasterLifetime, RecoveryState, ServerDBInfo};
    use crate::messages::{MasterInterface, WorkerInterface};
    use crate::recruit::RecruitCtx;
    use crate::state::{ClusterState, WorkerInfo};

    struct Harness {
        state: ClusterState,
        detector: FailureDetector,
        knobs: Knobs,
        desired: AsyncVar<Option<Vec<Option<DcId>>>>,
        clock: Clock,
        next_port: u16,
    }

    impl Harness {
        fn new() -> Self {
            let knobs = Knobs::default();
            let clock = Clock::new();
            let local: SocketAddr = "10.0.0.1:4000".parse().unwrap();
            Self {
                state: ClusterState::with_rng(clock.now(), StdRng::seed_from_u64(7)),
                detector: FailureDetector::new(local, Arc::new(knobs.clone()), clock.clone()),
                knobs,
                desired: AsyncVar::new(None),
                clock,
                next_port: 5000,
            }
        }

        fn ctx(&self) -> RecruitCtx<'_> {
            RecruitCtx {
                knobs: &self.knobs,
                detector: &self.detector,
                desired_dc_ids: &self.desired,
                now: self.clock.now(),
            }
        }

        fn add_worker(&mut self, process: &str, zone: &str, class_type: ClassType) -> WorkerInterface {
            let address: SocketAddr = format!("10.0.0.5:{}", self.next_port).parse().unwrap();
            self.next_port += 1;
            let locality = Locality::new(process).with_zone(zone).with_dc("dc1");
            let (interface, _endpoints) = WorkerInterface::new(address, locality);
            let class = ProcessClass::new(class_type, ClassSource::CommandLine);
            self.state.id_worker.insert(
                ProcessId::from(process),
                WorkerInfo {
                    watcher: None,
                    reply: ReplySlot::empty(),
                    generation: 1,
                    reboots: 0,
                    last_available_time: 0.0,
                    interface: interface.clone(),
                    initial_class: class,
                    process_class: class,
                    priority_info: PriorityInfo::default(),
                },
            );
            interface
        }
    }

    /// Builds a steady-state cluster: master on `master_process`, three
    /// transaction logs, one stateless process carrying proxy and
    /// resolver.
    fn steady_state(h: &mut Harness, master_process: &str) -> ServerDBInfo {
        let t0 = h.add_worker("t0", "z1", ClassType::TLog);
        let t1 = h.add_worker("t1", "z2", ClassType::TLog);
        let t2 = h.add_worker("t2", "z3", ClassType::TLog);
        let s0 = h.add_worker("s0", "z4", ClassType::Stateless);
        let s1 = h.add_worker("s1", "z5", ClassType::Stateless);
        let cc = h.add_worker("cc", "z6", ClassType::Stateless);

        h.state.controller_process_id = Some(ProcessId::from("cc"));
        h.state.controller_dc_id = Some(DcId::new("dc1"));
        h.state.db.config = DatabaseConfiguration::triple();

        let master_interface = match master_process {
            "s0" => s0.clone(),
            "cc" => cc.clone(),
            other => panic!("unexpected master process {other}"),
        };

        let mut info = ServerDBInfo::new(Uuid::new_v4());
        info.master = Some(MasterInterface {
            id: Uuid::new_v4(),
            address: master_interface.address,
            locality: master_interface.locality.clone(),
        });
        info.master_lifetime = MasterLifetime::new(info.controller_id);
        info.recovery_state = RecoveryState::FullyRecovered;
        info.log_system_config.log_sets = vec![LogSet {
            is_local: true,
            is_satellite: false,
            tlogs: vec![
                LogRef::new("t0", t0.address),
                LogRef::new("t1", t1.address),
                LogRef::new("t2", t2.address),
            ],
            log_routers: vec![],
            policy: None,
        }];
        info.client.proxies = vec![LogRef::new("s0", s0.address), LogRef::new("s1", s1.address)];
        info.resolvers = vec![LogRef::new("s0", s0.address)];
        info
    }

    #[test]
    fn test_false_before_accepting_commits() {
        let mut h = Harness::new();
        let mut dbi = steady_state(&mut h, "s0");
        dbi.recovery_state = RecoveryState::Recruiting;
        let ctx = RecruitCtx {
            knobs: &h.knobs,
            detector: &h.detector,
            desired_dc_ids: &h.desired,
            now: h.clock.now(),
        };
        assert!(!h.state.better_master_exists(&ctx, &dbi));
    }

    #[test]
    fn test_steady_state_needs_no_failover() {
        let mut h = Harness::new();
        let dbi = steady_state(&mut h, "s0");
        let ctx = RecruitCtx {
            knobs: &h.knobs,
            detector: &h.detector,
            desired_dc_ids: &h.desired,
            now: h.clock.now(),
        };
        assert!(!h.state.better_master_exists(&ctx, &dbi));
    }

    #[test]
    fn test_excluding_master_forces_failover() {
        let mut h = Harness::new();
        let dbi = steady_state(&mut h, "s0");

        // The operator excludes the master's address after the fact.
        let master_addr = dbi.master.as_ref().unwrap().address;
        h.state.db.config.excluded_servers.push(AddressExclusion::address(master_addr));

        let ctx = RecruitCtx {
            knobs: &h.knobs,
            detector: &h.detector,
            desired_dc_ids: &h.desired,
            now: h.clock.now(),
        };
        assert!(h.state.better_master_exists(&ctx, &dbi));
    }

    #[test]
    fn test_excluded_tlog_forces_failover() {
        let mut h = Harness::new();
        let dbi = steady_state(&mut h, "s0");
        h.state
            .id_worker
            .get_mut(&ProcessId::from("t1"))
            .unwrap()
            .priority_info
            .is_excluded = true;

        let ctx = RecruitCtx {
            knobs: &h.knobs,
            detector: &h.detector,
            desired_dc_ids: &h.desired,
            now: h.clock.now(),
        };
        assert!(h.state.better_master_exists(&ctx, &dbi));
    }

    #[test]
    fn test_master_on_controller_prefers_moving_off() {
        let mut h = Harness::new();
        let dbi = steady_state(&mut h, "cc");
        let ctx = RecruitCtx {
            knobs: &h.knobs,
            detector: &h.detector,
            desired_dc_ids: &h.desired,
            now: h.clock.now(),
        };
        // Another equally fit stateless process exists, so the master
        // should not share the controller's process.
        assert!(h.state.better_master_exists(&ctx, &dbi));
    }

    #[test]
    fn test_excluded_controller_suppresses_failover() {
        let mut h = Harness::new();
        let dbi = steady_state(&mut h, "cc");
        h.state
            .id_worker
            .get_mut(&ProcessId::from("cc"))
            .unwrap()
            .priority_info
            .is_excluded = true;

        let ctx = RecruitCtx {
            knobs: &h.knobs,
            detector: &h.detector,
            desired_dc_ids: &h.desired,
            now: h.clock.now(),
        };
        assert!(!h.state.better_master_exists(&ctx, &dbi));
    }

    #[test]
    fn test_unknown_log_process_defers() {
        let mut h = Harness::new();
        let mut dbi = steady_state(&mut h, "s0");
        dbi.log_system_config.log_sets[0]
            .tlogs
            .push(LogRef::new("ghost", "10.9.9.9:4500".parse().unwrap()));
        let ctx = RecruitCtx {
            knobs: &h.knobs,
            detector: &h.detector,
            desired_dc_ids: &h.desired,
            now: h.clock.now(),
        };
        assert!(!h.state.better_master_exists(&ctx, &dbi));
    }
}
