//! Policy-constrained role recruitment.
//!
//! All selection runs synchronously against a locked [`ClusterState`]
//! snapshot; nothing here suspends. Selection walks fitness buckets from
//! best to worst, validates replication policies over the accumulated
//! candidates, and charges every pick against `id_used` so processes do
//! not silently collect roles.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use helmsman_core::class::{Fitness, ProcessClass, Role};
use helmsman_core::error::{Error, Result};
use helmsman_core::knobs::Knobs;
use helmsman_core::sync::AsyncVar;
use helmsman_core::types::{DcId, ProcessId};
use helmsman_detector::server::FailureDetector;
use helmsman_placement::config::{DatabaseConfiguration, RegionInfo};
use helmsman_placement::locality::LocalityMap;
use helmsman_placement::policy::ReplicationPolicy;
use helmsman_placement::select::find_best_policy_set;

use crate::messages::{
    RecruitFromConfigurationReply, RecruitRemoteFromConfigurationReply, RecruitStorageRequest,
    WorkerInterface,
};
use crate::state::{ClusterState, WorkerInfo};

/// Per-recruit bookkeeping of how many roles each process already serves.
pub type IdUsed = HashMap<ProcessId, usize>;

/// Read-only context threaded through every selection call.
pub struct RecruitCtx<'a> {
    /// Knob set.
    pub knobs: &'a Knobs,
    /// Availability source.
    pub detector: &'a FailureDetector,
    /// Published datacenter priorities; recruitment updates these so a
    /// controller in the wrong datacenter can be replaced.
    pub desired_dc_ids: &'a AsyncVar<Option<Vec<Option<DcId>>>>,
    /// Current time on the controller clock.
    pub now: f64,
}

/// A single chosen worker together with its selection rank.
#[derive(Debug, Clone)]
pub struct WorkerFitnessInfo {
    /// The chosen worker and its effective class.
    pub worker: (WorkerInterface, ProcessClass),
    /// Fitness it was chosen at (after exclusion clamping).
    pub fitness: Fitness,
    /// Roles the process already served when chosen.
    pub used: usize,
}

/// Aggregate fitness of a set selected for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleFitness {
    /// Best member fitness.
    pub best_fit: Fitness,
    /// Worst member fitness.
    pub worst_fit: Fitness,
    /// Member count.
    pub count: usize,
}

impl RoleFitness {
    /// Creates an aggregate from explicit bounds.
    pub fn new(best_fit: Fitness, worst_fit: Fitness, count: usize) -> Self {
        Self { best_fit, worst_fit, count }
    }

    /// An aggregate where every member has the same fitness.
    pub fn uniform(fitness: Fitness, count: usize) -> Self {
        Self::new(fitness, fitness, count)
    }

    /// The empty aggregate; compares worse than anything real.
    pub fn empty() -> Self {
        Self::new(Fitness::NeverAssign, Fitness::NeverAssign, 0)
    }

    /// Merges two role aggregates into the combined transaction-subsystem
    /// aggregate: bounds track the worst fits of both sides.
    pub fn combine(first: Self, second: Self) -> Self {
        Self::new(
            first.worst_fit.min(second.worst_fit),
            first.worst_fit.max(second.worst_fit),
            first.count + second.count,
        )
    }

    /// Aggregates a chosen worker set for `role`.
    pub fn of_workers(workers: &[(WorkerInterface, ProcessClass)], role: Role) -> Self {
        Self::of_classes_iter(workers.iter().map(|(_, class)| *class), role)
    }

    /// Aggregates a class set for `role`.
    pub fn of_classes(classes: &[ProcessClass], role: Role) -> Self {
        Self::of_classes_iter(classes.iter().copied(), role)
    }

    fn of_classes_iter(classes: impl Iterator<Item = ProcessClass>, role: Role) -> Self {
        let mut best_fit = Fitness::NeverAssign;
        let mut worst_fit = Fitness::Best;
        let mut count = 0;
        for class in classes {
            let fit = class.role_fitness(role);
            best_fit = best_fit.min(fit);
            worst_fit = worst_fit.max(fit);
            count += 1;
        }
        Self::new(best_fit, worst_fit, count)
    }

    /// Strict "is a better placement than": lower worst fit, then lower
    /// best fit, then higher count.
    pub fn is_better_than(&self, other: &Self) -> bool {
        if self.worst_fit != other.worst_fit {
            return self.worst_fit < other.worst_fit;
        }
        if self.best_fit != other.best_fit {
            return self.best_fit < other.best_fit;
        }
        self.count > other.count
    }

    /// Fitness-only comparison; redundancy counts are ignored.
    pub fn better_fitness(&self, other: &Self) -> bool {
        if self.worst_fit != other.worst_fit {
            return self.worst_fit < other.worst_fit;
        }
        if self.best_fit != other.best_fit {
            return self.best_fit < other.best_fit;
        }
        false
    }

    /// Count-first comparison used by the grace-window gate.
    pub fn better_count(&self, other: &Self) -> bool {
        if self.count > other.count {
            return true;
        }
        self.worst_fit < other.worst_fit
    }
}

fn bump(id_used: &mut IdUsed, id: Option<&ProcessId>) {
    if let Some(id) = id {
        *id_used.entry(id.clone()).or_default() += 1;
    }
}

impl ClusterState {
    /// True when the worker may be recruited right now.
    ///
    /// Within the startup grace window every registered worker counts as
    /// available; afterwards the failure monitor decides, and stable
    /// placements additionally require fewer than two recent reboots.
    pub fn worker_available(&self, ctx: &RecruitCtx<'_>, worker: &WorkerInfo, check_stable: bool) -> bool {
        ctx.now - self.start_time < ctx.knobs.availability_grace()
            || (ctx.detector.is_available(worker.interface.address)
                && (!check_stable || worker.reboots < 2))
    }

    /// Picks one worker for a storage recruit.
    pub fn get_storage_worker(
        &self,
        ctx: &RecruitCtx<'_>,
        req: &RecruitStorageRequest,
    ) -> Result<(WorkerInterface, ProcessClass)> {
        let excluded_zone = |worker: &WorkerInfo| {
            worker
                .interface
                .locality
                .zone_id
                .as_deref()
                .is_some_and(|z| req.exclude_machines.iter().any(|m| m == z))
        };
        let dc_allowed = |worker: &WorkerInfo| {
            req.include_dcs.is_empty()
                || worker
                    .interface
                    .locality
                    .dc_id
                    .as_ref()
                    .is_some_and(|dc| req.include_dcs.contains(dc))
        };
        let address_excluded = |worker: &WorkerInfo| {
            req.exclude_addresses.iter().any(|e| e.excludes(worker.interface.address))
        };

        for worker in self.id_worker.values() {
            if self.worker_available(ctx, worker, false)
                && !excluded_zone(worker)
                && dc_allowed(worker)
                && !address_excluded(worker)
                && worker.process_class.role_fitness(Role::Storage) <= Fitness::UnsetFit
            {
                return Ok((worker.interface.clone(), worker.process_class));
            }
        }

        if req.critical_recruitment {
            let mut best: Option<(Fitness, (WorkerInterface, ProcessClass))> = None;
            for worker in self.id_worker.values() {
                let fit = worker.process_class.role_fitness(Role::Storage);
                if self.worker_available(ctx, worker, false)
                    && !excluded_zone(worker)
                    && dc_allowed(worker)
                    && !address_excluded(worker)
                    && fit < best.as_ref().map_or(Fitness::NeverAssign, |(f, _)| *f)
                {
                    best = Some((fit, (worker.interface.clone(), worker.process_class)));
                }
            }
            if let Some((_, chosen)) = best {
                return Ok(chosen);
            }
        }

        Err(Error::NoMoreServers)
    }

    /// Picks seed storage servers satisfying the storage policy.
    pub fn get_workers_for_seed_servers(
        &mut self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        policy: &ReplicationPolicy,
        dc_id: Option<&DcId>,
    ) -> Result<Vec<(WorkerInterface, ProcessClass)>> {
        let mut fitness_workers: BTreeMap<Fitness, Vec<(WorkerInterface, ProcessClass)>> =
            BTreeMap::new();
        for worker in self.id_worker.values() {
            let fitness = worker.process_class.role_fitness(Role::Storage);
            if self.worker_available(ctx, worker, false)
                && !conf.is_excluded_server(worker.interface.address)
                && fitness != Fitness::NeverAssign
                && (dc_id.is_none() || worker.interface.locality.dc_id.as_ref() == dc_id)
            {
                fitness_workers
                    .entry(fitness)
                    .or_default()
                    .push((worker.interface.clone(), worker.process_class));
            }
        }

        let mut candidates: LocalityMap<(WorkerInterface, ProcessClass)> = LocalityMap::new();
        for workers in fitness_workers.into_values() {
            for (interface, class) in workers {
                candidates.add(interface.locality.clone(), (interface, class));
            }
            if let Some(chosen) = policy.select_replicas(&candidates, &mut self.rng) {
                return Ok(candidates.take_at(&chosen));
            }
        }

        Err(Error::NoMoreServers)
    }

    /// Picks transaction logs: accumulate fitness buckets from best to
    /// worst until the set exactly meets `required` (validated), stays
    /// within `desired` (validated), or exceeds it, at which point the
    /// sampled search looks for the best satisfying subset of size
    /// `desired`.
    ///
    /// `id_used` is only charged on success.
    #[allow(clippy::too_many_arguments)]
    pub fn get_workers_for_tlogs(
        &mut self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        required: usize,
        desired: usize,
        policy: &ReplicationPolicy,
        id_used: &mut IdUsed,
        check_stable: bool,
        dc_ids: &[DcId],
    ) -> Result<Vec<(WorkerInterface, ProcessClass)>> {
        let mut fitness_workers: BTreeMap<Fitness, Vec<(WorkerInterface, ProcessClass)>> =
            BTreeMap::new();
        let mut unavailable = 0usize;

        for worker in self.id_worker.values() {
            let fitness = worker.process_class.role_fitness(Role::TLog);
            let dc_ok = dc_ids.is_empty()
                || worker.interface.locality.dc_id.as_ref().is_some_and(|dc| dc_ids.contains(dc));
            if self.worker_available(ctx, worker, check_stable)
                && !conf.is_excluded_server(worker.interface.address)
                && fitness != Fitness::NeverAssign
                && dc_ok
            {
                fitness_workers
                    .entry(fitness)
                    .or_default()
                    .push((worker.interface.clone(), worker.process_class));
            } else {
                unavailable += 1;
            }
        }

        let mut candidates: LocalityMap<(WorkerInterface, ProcessClass)> = LocalityMap::new();
        let mut chosen: Option<Vec<usize>> = None;

        for (fitness, workers) in &fitness_workers {
            for (interface, class) in workers {
                candidates.add(interface.locality.clone(), (interface.clone(), *class));
            }

            if candidates.len() < required {
                debug!(?fitness, processes = candidates.len(), required, "Too few log candidates");
            } else if candidates.len() == required || candidates.len() <= desired {
                if policy.validate(&candidates.localities()) {
                    chosen = Some((0..candidates.len()).collect());
                    break;
                }
                debug!(?fitness, processes = candidates.len(), %policy, "Log candidates do not satisfy policy");
            } else if let Some(best) = find_best_policy_set(
                &candidates,
                policy,
                desired,
                ctx.knobs.policy_rating_tests,
                ctx.knobs.policy_generations,
                &mut self.rng,
            ) {
                chosen = Some(best);
                break;
            } else {
                debug!(?fitness, processes = candidates.len(), %policy, "No best log set at this fitness");
            }
        }

        let Some(chosen) = chosen else {
            warn!(
                %policy,
                processes = candidates.len(),
                workers = self.id_worker.len(),
                unavailable,
                required,
                desired,
                "Log recruitment failed"
            );
            return Err(Error::NoMoreServers);
        };

        let results = candidates.take_at(&chosen);
        for (interface, _) in &results {
            bump(id_used, Some(&interface.locality.process_id));
        }
        debug!(results = results.len(), required, desired, %policy, "Log recruitment complete");
        Ok(results)
    }

    /// Picks satellite logs by sliding a window over the region's satellite
    /// datacenters, engaging the fallback policy once the primary policy is
    /// infeasible and the startup grace window has passed.
    pub fn get_workers_for_satellite_logs(
        &mut self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        region: &RegionInfo,
        id_used: &mut IdUsed,
        satellite_fallback: &mut bool,
        check_stable: bool,
    ) -> Result<Vec<(WorkerInterface, ProcessClass)>> {
        let mut start_dc = 0usize;
        loop {
            let usable_dcs = if *satellite_fallback {
                region.satellite_tlog_usable_dcs_fallback
            } else {
                region.satellite_tlog_usable_dcs
            };

            if start_dc > 0 && start_dc + usable_dcs > region.satellites.len() {
                if *satellite_fallback || region.satellite_tlog_usable_dcs_fallback == 0 {
                    return Err(Error::NoMoreServers);
                }
                if ctx.now - self.start_time < ctx.knobs.wait_for_good_recruitment_delay {
                    return Err(Error::OperationFailed);
                }
                info!(region = %region.dc_id, "Engaging satellite fallback policy");
                *satellite_fallback = true;
                start_dc = 0;
                continue;
            }

            let window_end = (start_dc + usable_dcs).min(region.satellites.len());
            let satellite_dcs: Vec<DcId> =
                region.satellites[start_dc..window_end].iter().map(|s| s.dc_id.clone()).collect();

            let attempt = if *satellite_fallback {
                let policy = region
                    .satellite_tlog_policy_fallback
                    .as_ref()
                    .ok_or(Error::NoMoreServers)?;
                let desired = conf.desired_satellite_logs_for(&region.dc_id)
                    * region.satellite_tlog_usable_dcs_fallback
                    / region.satellite_tlog_usable_dcs.max(1);
                self.get_workers_for_tlogs(
                    ctx,
                    conf,
                    region.satellite_tlog_replication_factor_fallback,
                    desired.max(region.satellite_tlog_replication_factor_fallback),
                    policy,
                    id_used,
                    check_stable,
                    &satellite_dcs,
                )
            } else {
                let policy =
                    region.satellite_tlog_policy.as_ref().ok_or(Error::NoMoreServers)?;
                self.get_workers_for_tlogs(
                    ctx,
                    conf,
                    region.satellite_tlog_replication_factor,
                    conf.desired_satellite_logs_for(&region.dc_id)
                        .max(region.satellite_tlog_replication_factor),
                    policy,
                    id_used,
                    check_stable,
                    &satellite_dcs,
                )
            };

            match attempt {
                Ok(workers) => return Ok(workers),
                Err(Error::NoMoreServers) => {}
                Err(err) => return Err(err),
            }

            start_dc += 1;
        }
    }

    /// Picks the single best available worker for `role` in `dc`, breaking
    /// ties among equal `(fitness, used)` buckets by random shuffle.
    /// Charges `id_used` for the pick.
    #[allow(clippy::too_many_arguments)]
    pub fn get_worker_for_role_in_datacenter(
        &mut self,
        ctx: &RecruitCtx<'_>,
        dc: Option<&DcId>,
        role: Role,
        unacceptable_fitness: Fitness,
        conf: &DatabaseConfiguration,
        id_used: &mut IdUsed,
        check_stable: bool,
    ) -> Result<WorkerFitnessInfo> {
        let mut fitness_workers: BTreeMap<(Fitness, usize), Vec<(WorkerInterface, ProcessClass)>> =
            BTreeMap::new();

        for (id, worker) in &self.id_worker {
            let mut fitness = worker.process_class.role_fitness(role);
            if conf.is_excluded_server(worker.interface.address) {
                fitness = fitness.max(Fitness::ExcludeFit);
            }
            if self.worker_available(ctx, worker, check_stable)
                && fitness < unacceptable_fitness
                && worker.interface.locality.dc_id.as_ref() == dc
            {
                let used = id_used.get(id).copied().unwrap_or(0);
                fitness_workers
                    .entry((fitness, used))
                    .or_default()
                    .push((worker.interface.clone(), worker.process_class));
            }
        }

        for ((fitness, used), mut workers) in fitness_workers {
            workers.shuffle(&mut self.rng);
            if let Some(worker) = workers.into_iter().next() {
                bump(id_used, Some(&worker.0.locality.process_id));
                return Ok(WorkerFitnessInfo { worker, fitness, used });
            }
        }

        Err(Error::NoMoreServers)
    }

    /// Picks up to `amount` further workers for `role` in `dc`. When
    /// `min_worker` is given, candidates are restricted to workers no
    /// better-fit than it, and the minimum worker itself is skipped.
    /// Returns fewer than `amount` when the datacenter runs dry.
    #[allow(clippy::too_many_arguments)]
    pub fn get_workers_for_role_in_datacenter(
        &mut self,
        ctx: &RecruitCtx<'_>,
        dc: Option<&DcId>,
        role: Role,
        amount: usize,
        conf: &DatabaseConfiguration,
        id_used: &mut IdUsed,
        min_worker: Option<&WorkerFitnessInfo>,
        check_stable: bool,
    ) -> Vec<(WorkerInterface, ProcessClass)> {
        let mut results = Vec::new();
        if amount == 0 {
            return results;
        }

        let mut fitness_workers: BTreeMap<(Fitness, usize), Vec<(WorkerInterface, ProcessClass)>> =
            BTreeMap::new();

        for (id, worker) in &self.id_worker {
            let fitness = worker.process_class.role_fitness(role);
            let acceptable = match min_worker {
                Some(min) => {
                    worker.interface.id != min.worker.0.id && fitness >= min.fitness
                }
                None => true,
            };
            if self.worker_available(ctx, worker, check_stable)
                && !conf.is_excluded_server(worker.interface.address)
                && fitness != Fitness::NeverAssign
                && worker.interface.locality.dc_id.as_ref() == dc
                && acceptable
            {
                let used = id_used.get(id).copied().unwrap_or(0);
                fitness_workers
                    .entry((fitness, used))
                    .or_default()
                    .push((worker.interface.clone(), worker.process_class));
            }
        }

        for (_, mut workers) in fitness_workers {
            workers.shuffle(&mut self.rng);
            for worker in workers {
                bump(id_used, Some(&worker.0.locality.process_id));
                results.push(worker);
                if results.len() == amount {
                    return results;
                }
            }
        }

        results
    }

    /// Datacenters that still hold available, non-excluded workers.
    pub fn get_datacenters(
        &self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        check_stable: bool,
    ) -> Vec<Option<DcId>> {
        let mut dcs: BTreeSet<Option<DcId>> = BTreeSet::new();
        for worker in self.id_worker.values() {
            if self.worker_available(ctx, worker, check_stable)
                && !conf.is_excluded_server(worker.interface.address)
            {
                dcs.insert(worker.interface.locality.dc_id.clone());
            }
        }
        dcs.into_iter().collect()
    }

    /// Recruits the remote region's logs and log routers.
    pub fn find_remote_workers_for_configuration(
        &mut self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        dc: &DcId,
        log_router_count: usize,
    ) -> Result<RecruitRemoteFromConfigurationReply> {
        let mut id_used = IdUsed::new();
        bump(&mut id_used, self.master_process_id.as_ref());
        bump(&mut id_used, self.controller_process_id.as_ref());

        let remote_logs = self.get_workers_for_tlogs(
            ctx,
            conf,
            conf.remote_tlog_replication_factor,
            conf.desired_remote_logs,
            &conf.remote_tlog_policy,
            &mut id_used,
            false,
            std::slice::from_ref(dc),
        )?;

        let log_routers = self.get_workers_for_role_in_datacenter(
            ctx,
            Some(dc),
            Role::LogRouter,
            log_router_count,
            conf,
            &mut id_used,
            None,
            false,
        );

        if self.remote_start_time.is_none() {
            let mut max_available_time: f64 = 0.0;
            for (interface, _) in remote_logs.iter().chain(log_routers.iter()) {
                if let Some(worker) = self.id_worker.get(&interface.locality.process_id) {
                    max_available_time = max_available_time.max(worker.last_available_time);
                }
            }
            self.remote_start_time = Some(max_available_time);
        }

        let remote_start = self.remote_start_time.unwrap_or(self.start_time);
        if ctx.now - remote_start < ctx.knobs.wait_for_good_remote_recruitment_delay
            && (RoleFitness::uniform(ctx.knobs.expected_tlog_fitness, conf.desired_remote_logs)
                .better_count(&RoleFitness::of_workers(&remote_logs, Role::TLog))
                || RoleFitness::uniform(ctx.knobs.expected_log_router_fitness, log_router_count)
                    .better_count(&RoleFitness::of_workers(&log_routers, Role::LogRouter)))
        {
            return Err(Error::OperationFailed);
        }

        Ok(RecruitRemoteFromConfigurationReply {
            remote_tlogs: remote_logs.into_iter().map(|(w, _)| w).collect(),
            log_routers: log_routers.into_iter().map(|(w, _)| w).collect(),
        })
    }

    /// Recruits the full role set inside one datacenter.
    ///
    /// The outer `Result` carries hard selection failures; the inner one
    /// carries the grace-window "feasible but not good enough" verdict, so
    /// callers can publish datacenter priorities before propagating it.
    pub fn find_workers_for_configuration_in_dc(
        &mut self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        recruit_seed_servers: bool,
        max_old_log_routers: usize,
        dc: &DcId,
    ) -> Result<std::result::Result<RecruitFromConfigurationReply, Error>> {
        let mut id_used = IdUsed::new();
        bump(&mut id_used, self.master_process_id.as_ref());
        bump(&mut id_used, self.controller_process_id.as_ref());

        let region =
            conf.region_for(dc).cloned().unwrap_or_else(|| RegionInfo::new(dc.clone(), 0));

        let mut result = RecruitFromConfigurationReply { dc_id: Some(dc.clone()), ..Default::default() };

        if recruit_seed_servers {
            let seeds =
                self.get_workers_for_seed_servers(ctx, conf, &conf.storage_policy, Some(dc))?;
            result.storage_servers = seeds.into_iter().map(|(w, _)| w).collect();
        }

        let tlogs = self.get_workers_for_tlogs(
            ctx,
            conf,
            conf.tlog_replication_factor,
            conf.desired_logs,
            &conf.tlog_policy,
            &mut id_used,
            false,
            std::slice::from_ref(dc),
        )?;
        result.tlogs = tlogs.iter().map(|(w, _)| w.clone()).collect();

        let mut satellite_logs = Vec::new();
        if region.satellite_tlog_replication_factor > 0 {
            satellite_logs = self.get_workers_for_satellite_logs(
                ctx,
                conf,
                &region,
                &mut id_used,
                &mut result.satellite_fallback,
                false,
            )?;
            result.satellite_tlogs = satellite_logs.iter().map(|(w, _)| w.clone()).collect();
        }

        let first_resolver = self.get_worker_for_role_in_datacenter(
            ctx,
            Some(dc),
            Role::Resolver,
            Fitness::ExcludeFit,
            conf,
            &mut id_used,
            false,
        )?;
        let first_proxy = self.get_worker_for_role_in_datacenter(
            ctx,
            Some(dc),
            Role::Proxy,
            Fitness::ExcludeFit,
            conf,
            &mut id_used,
            false,
        )?;

        let mut proxies = self.get_workers_for_role_in_datacenter(
            ctx,
            Some(dc),
            Role::Proxy,
            conf.desired_proxies.saturating_sub(1),
            conf,
            &mut id_used,
            Some(&first_proxy),
            false,
        );
        let mut resolvers = self.get_workers_for_role_in_datacenter(
            ctx,
            Some(dc),
            Role::Resolver,
            conf.desired_resolvers.saturating_sub(1),
            conf,
            &mut id_used,
            Some(&first_resolver),
            false,
        );
        proxies.push(first_proxy.worker.clone());
        resolvers.push(first_resolver.worker.clone());

        result.proxies = proxies.iter().map(|(w, _)| w.clone()).collect();
        result.resolvers = resolvers.iter().map(|(w, _)| w.clone()).collect();

        let old_log_routers = self.get_workers_for_role_in_datacenter(
            ctx,
            Some(dc),
            Role::LogRouter,
            max_old_log_routers,
            conf,
            &mut id_used,
            None,
            false,
        );
        result.old_log_routers = old_log_routers.into_iter().map(|(w, _)| w).collect();

        if ctx.now - self.start_time < ctx.knobs.wait_for_good_recruitment_delay
            && (RoleFitness::uniform(ctx.knobs.expected_tlog_fitness, conf.desired_logs)
                .better_count(&RoleFitness::of_workers(&tlogs, Role::TLog))
                || (region.satellite_tlog_replication_factor > 0
                    && RoleFitness::uniform(
                        ctx.knobs.expected_tlog_fitness,
                        conf.desired_satellite_logs_for(dc),
                    )
                    .better_count(&RoleFitness::of_workers(&satellite_logs, Role::TLog)))
                || RoleFitness::uniform(ctx.knobs.expected_proxy_fitness, conf.desired_proxies)
                    .better_count(&RoleFitness::of_workers(&proxies, Role::Proxy))
                || RoleFitness::uniform(ctx.knobs.expected_resolver_fitness, conf.desired_resolvers)
                    .better_count(&RoleFitness::of_workers(&resolvers, Role::Resolver)))
        {
            return Ok(Err(Error::OperationFailed));
        }

        Ok(Ok(result))
    }

    /// Recruits the full role set, dispatching on the configured region
    /// count and steering datacenter priorities as a side effect.
    pub fn find_workers_for_configuration(
        &mut self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        recruit_seed_servers: bool,
        max_old_log_routers: usize,
    ) -> Result<RecruitFromConfigurationReply> {
        if conf.regions.len() > 1 {
            self.find_workers_two_regions(ctx, conf, recruit_seed_servers, max_old_log_routers)
        } else if conf.regions.len() == 1 {
            let dc = conf.regions[0].dc_id.clone();
            ctx.desired_dc_ids.set(Some(vec![Some(dc.clone())]));
            let reply = self.find_workers_for_configuration_in_dc(
                ctx,
                conf,
                recruit_seed_servers,
                max_old_log_routers,
                &dc,
            )?;
            match reply {
                Err(err) => Err(err),
                Ok(reply) if self.controller_dc_id.as_ref() == Some(&dc) => Ok(reply),
                Ok(_) => Err(Error::NoMoreServers),
            }
        } else {
            self.find_workers_no_regions(ctx, conf, recruit_seed_servers, max_old_log_routers)
        }
    }

    fn find_workers_two_regions(
        &mut self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        recruit_seed_servers: bool,
        max_old_log_routers: usize,
    ) -> Result<RecruitFromConfigurationReply> {
        let mut regions = [conf.regions[0].clone(), conf.regions[1].clone()];

        // Prefer the controller's own region on priority ties.
        if regions[0].priority == regions[1].priority
            && self.controller_dc_id.as_ref() == Some(&regions[1].dc_id)
        {
            regions.swap(0, 1);
        }
        // Avoid failing over into a badly lagging region.
        if self.controller_dc_id.as_ref() == Some(&regions[1].dc_id)
            && regions[1].priority >= 0
            && (!self.version_difference_updated
                || self.datacenter_version_difference >= ctx.knobs.max_version_difference)
        {
            regions.swap(0, 1);
        }

        let mut set_primary_desired = false;
        let primary_attempt: Result<RecruitFromConfigurationReply> = (|| {
            let reply = self.find_workers_for_configuration_in_dc(
                ctx,
                conf,
                recruit_seed_servers,
                max_old_log_routers,
                &regions[0].dc_id,
            )?;
            set_primary_desired = true;
            ctx.desired_dc_ids
                .set(Some(vec![Some(regions[0].dc_id.clone()), Some(regions[1].dc_id.clone())]));
            let reply = reply?;
            if self.controller_dc_id.as_ref() == Some(&regions[0].dc_id) {
                Ok(reply)
            } else {
                Err(Error::NoMoreServers)
            }
        })();

        let err = match primary_attempt {
            Ok(reply) => return Ok(reply),
            Err(err) => err,
        };

        if ctx.now - self.start_time < ctx.knobs.wait_for_good_remote_recruitment_delay
            && self.controller_dc_id.as_ref() != Some(&regions[1].dc_id)
        {
            return Err(Error::OperationFailed);
        }
        if !matches!(err, Error::NoMoreServers) || regions[1].priority < 0 {
            return Err(err);
        }

        warn!(dc = %regions[1].dc_id, "Attempting recruitment in the secondary region");
        let reply = self.find_workers_for_configuration_in_dc(
            ctx,
            conf,
            recruit_seed_servers,
            max_old_log_routers,
            &regions[1].dc_id,
        )?;
        if !set_primary_desired {
            ctx.desired_dc_ids
                .set(Some(vec![Some(regions[1].dc_id.clone()), Some(regions[0].dc_id.clone())]));
        }
        let reply = reply?;
        if self.controller_dc_id.as_ref() == Some(&regions[1].dc_id) {
            Ok(reply)
        } else {
            Err(err)
        }
    }

    fn find_workers_no_regions(
        &mut self,
        ctx: &RecruitCtx<'_>,
        conf: &DatabaseConfiguration,
        recruit_seed_servers: bool,
        max_old_log_routers: usize,
    ) -> Result<RecruitFromConfigurationReply> {
        let mut id_used = IdUsed::new();
        bump(&mut id_used, self.master_process_id.as_ref());
        bump(&mut id_used, self.controller_process_id.as_ref());

        let mut result = RecruitFromConfigurationReply::default();

        let tlogs = self.get_workers_for_tlogs(
            ctx,
            conf,
            conf.tlog_replication_factor,
            conf.desired_logs,
            &conf.tlog_policy,
            &mut id_used,
            false,
            &[],
        )?;
        result.tlogs = tlogs.iter().map(|(w, _)| w.clone()).collect();

        if recruit_seed_servers {
            let seeds =
                self.get_workers_for_seed_servers(ctx, conf, &conf.storage_policy, None)?;
            result.storage_servers = seeds.into_iter().map(|(w, _)| w).collect();
        }

        // Estimate the transaction subsystem in every datacenter and keep
        // the best; ties break by reservoir sampling so restarts do not
        // herd onto one datacenter.
        let datacenters = self.get_datacenters(ctx, conf, false);
        let mut best_fitness = RoleFitness::empty();
        let mut best_dc: Option<DcId> = None;
        let mut num_equivalent = 1u32;

        for dc in datacenters {
            let mut used = id_used.clone();
            let attempt: Result<(RoleFitness, Vec<_>, Vec<_>, IdUsed)> = (|| {
                let first_resolver = self.get_worker_for_role_in_datacenter(
                    ctx,
                    dc.as_ref(),
                    Role::Resolver,
                    Fitness::ExcludeFit,
                    conf,
                    &mut used,
                    false,
                )?;
                let first_proxy = self.get_worker_for_role_in_datacenter(
                    ctx,
                    dc.as_ref(),
                    Role::Proxy,
                    Fitness::ExcludeFit,
                    conf,
                    &mut used,
                    false,
                )?;

                let mut proxies = self.get_workers_for_role_in_datacenter(
                    ctx,
                    dc.as_ref(),
                    Role::Proxy,
                    conf.desired_proxies.saturating_sub(1),
                    conf,
                    &mut used,
                    Some(&first_proxy),
                    false,
                );
                let mut resolvers = self.get_workers_for_role_in_datacenter(
                    ctx,
                    dc.as_ref(),
                    Role::Resolver,
                    conf.desired_resolvers.saturating_sub(1),
                    conf,
                    &mut used,
                    Some(&first_resolver),
                    false,
                );
                proxies.push(first_proxy.worker.clone());
                resolvers.push(first_resolver.worker.clone());

                let fitness = RoleFitness::combine(
                    RoleFitness::of_workers(&proxies, Role::Proxy),
                    RoleFitness::of_workers(&resolvers, Role::Resolver),
                );
                Ok((fitness, proxies, resolvers, used))
            })();

            let (fitness, proxies, resolvers, mut used) = match attempt {
                Ok(found) => found,
                Err(Error::NoMoreServers) => continue,
                Err(err) => return Err(err),
            };

            if dc == self.controller_dc_id {
                best_fitness = fitness;
                best_dc = dc.clone();
                result.proxies = proxies.into_iter().map(|(w, _)| w).collect();
                result.resolvers = resolvers.into_iter().map(|(w, _)| w).collect();

                let old_log_routers = self.get_workers_for_role_in_datacenter(
                    ctx,
                    dc.as_ref(),
                    Role::LogRouter,
                    max_old_log_routers,
                    conf,
                    &mut used,
                    None,
                    false,
                );
                result.old_log_routers = old_log_routers.into_iter().map(|(w, _)| w).collect();
                break;
            } else if fitness.is_better_than(&best_fitness) {
                best_fitness = fitness;
                num_equivalent = 1;
                best_dc = dc;
            } else if fitness == best_fitness {
                num_equivalent += 1;
                if self.rng.random_range(0.0..1.0) < 1.0 / f64::from(num_equivalent) {
                    best_dc = dc;
                }
            }
        }

        if best_dc != self.controller_dc_id {
            ctx.desired_dc_ids.set(Some(vec![best_dc]));
            return Err(Error::NoMoreServers);
        }
        // If this controller dies, do not pin its successor to this
        // datacenter.
        ctx.desired_dc_ids.set(None);

        info!(
            replication = conf.tlog_replication_factor,
            desired_logs = conf.desired_logs,
            actual_logs = result.tlogs.len(),
            desired_proxies = conf.desired_proxies,
            actual_proxies = result.proxies.len(),
            desired_resolvers = conf.desired_resolvers,
            actual_resolvers = result.resolvers.len(),
            "Recruitment from configuration complete"
        );

        if ctx.now - self.start_time < ctx.knobs.wait_for_good_recruitment_delay
            && (RoleFitness::uniform(ctx.knobs.expected_tlog_fitness, conf.desired_logs)
                .better_count(&RoleFitness::of_workers(&tlogs, Role::TLog))
                || RoleFitness::new(
                    ctx.knobs.expected_proxy_fitness.min(ctx.knobs.expected_resolver_fitness),
                    ctx.knobs.expected_proxy_fitness.max(ctx.knobs.expected_resolver_fitness),
                    conf.desired_proxies + conf.desired_resolvers,
                )
                .better_count(&best_fitness))
        {
            return Err(Error::OperationFailed);
        }

        Ok(result)
    }

    /// Probes whether a complete, stable placement is feasible with the
    /// primary region first; publishes the priorities when it is.
    pub fn check_regions(&mut self, ctx: &RecruitCtx<'_>, regions: &[RegionInfo]) {
        if regions.len() < 2 {
            return;
        }
        if let Some(desired) = ctx.desired_dc_ids.get() {
            if desired.len() == 2
                && desired[0].as_ref() == Some(&regions[0].dc_id)
                && desired[1].as_ref() == Some(&regions[1].dc_id)
            {
                return;
            }
        }

        let conf = self.db.config.clone();
        let probe: Result<()> = (|| {
            let mut id_used = IdUsed::new();
            let dc = regions[0].dc_id.clone();
            self.get_worker_for_role_in_datacenter(
                ctx,
                Some(&dc),
                Role::ClusterController,
                Fitness::ExcludeFit,
                &conf,
                &mut id_used,
                true,
            )?;
            self.get_worker_for_role_in_datacenter(
                ctx,
                Some(&dc),
                Role::Master,
                Fitness::ExcludeFit,
                &conf,
                &mut id_used,
                true,
            )?;

            self.get_workers_for_tlogs(
                ctx,
                &conf,
                conf.tlog_replication_factor,
                conf.desired_logs,
                &conf.tlog_policy,
                &mut id_used,
                true,
                std::slice::from_ref(&dc),
            )?;
            if regions[0].satellite_tlog_replication_factor > 0 {
                let mut satellite_fallback = false;
                self.get_workers_for_satellite_logs(
                    ctx,
                    &conf,
                    &regions[0],
                    &mut id_used,
                    &mut satellite_fallback,
                    true,
                )?;
            }

            self.get_worker_for_role_in_datacenter(
                ctx,
                Some(&dc),
                Role::Resolver,
                Fitness::ExcludeFit,
                &conf,
                &mut id_used,
                true,
            )?;
            self.get_worker_for_role_in_datacenter(
                ctx,
                Some(&dc),
                Role::Proxy,
                Fitness::ExcludeFit,
                &conf,
                &mut id_used,
                true,
            )?;
            Ok(())
        })();

        match probe {
            Ok(()) => {
                ctx.desired_dc_ids.set(Some(vec![
                    Some(regions[0].dc_id.clone()),
                    Some(regions[1].dc_id.clone()),
                ]));
            }
            Err(Error::NoMoreServers | Error::OperationFailed) => {}
            Err(err) => {
                warn!(error = %err, "Region feasibility probe failed");
            }
        }
    }
}
