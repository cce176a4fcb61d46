//! Recruitment request actors and the outstanding-request driver.
//!
//! Requests that cannot be satisfied yet are parked on explicit queues and
//! re-attempted whenever feasibility may have changed: a worker registered,
//! a class changed, the version lag shrank, or the periodic tick fired.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, error, warn};

use helmsman_core::error::{Error, Result};

use crate::controller::Controller;
use crate::messages::{
    RecruitFromConfigurationRequest, RecruitRemoteFromConfigurationRequest, RecruitStorageRequest,
    RecruitStorageReply,
};

/// Serves one full-recruitment request, retrying until it succeeds, parks,
/// or fails fatally.
pub async fn recruit_from_configuration(
    controller: Arc<Controller>,
    req: RecruitFromConfigurationRequest,
) -> Result<()> {
    loop {
        let attempt = {
            let ctx = controller.recruit_ctx();
            let mut state = controller.state.write();
            let result = state.find_workers_for_configuration(
                &ctx,
                &req.configuration,
                req.recruit_seed_servers,
                req.max_old_log_routers,
            );
            match &result {
                Err(Error::NoMoreServers)
                    if ctx.now - state.start_time >= ctx.knobs.wait_for_good_recruitment_delay =>
                {
                    warn!("Recruitment not satisfiable; parking request");
                    state.outstanding_recruitment.push(req);
                    return Ok(());
                }
                _ => {}
            }
            result
        };

        match attempt {
            Ok(reply) => {
                counter!("helmsman_recruitments_satisfied").increment(1);
                let _ = req.reply.send(Ok(reply));
                return Ok(());
            }
            Err(Error::OperationFailed | Error::NoMoreServers) => {
                // Placement feasible but not yet good enough; retry.
            }
            Err(err) => {
                error!(error = %err, "Recruitment failed fatally");
                return Err(err);
            }
        }
        tokio::time::sleep(Duration::from_secs_f64(controller.knobs.attempt_recruitment_delay))
            .await;
    }
}

/// Serves one remote-recruitment request.
pub async fn recruit_remote_from_configuration(
    controller: Arc<Controller>,
    req: RecruitRemoteFromConfigurationRequest,
) -> Result<()> {
    loop {
        let attempt = {
            let ctx = controller.recruit_ctx();
            let mut state = controller.state.write();
            let result = state.find_remote_workers_for_configuration(
                &ctx,
                &req.configuration,
                &req.dc_id,
                req.log_router_count,
            );
            if let Err(Error::NoMoreServers) = &result {
                let past_grace = state.remote_start_time.is_some_and(|start| {
                    ctx.now - start >= ctx.knobs.wait_for_good_remote_recruitment_delay
                });
                if past_grace {
                    warn!(dc = %req.dc_id, "Remote recruitment not satisfiable; parking request");
                    state.outstanding_remote.push(req);
                    return Ok(());
                }
            }
            result
        };

        match attempt {
            Ok(reply) => {
                let _ = req.reply.send(Ok(reply));
                return Ok(());
            }
            Err(Error::OperationFailed | Error::NoMoreServers) => {}
            Err(err) => {
                error!(error = %err, "Remote recruitment failed fatally");
                return Err(err);
            }
        }
        tokio::time::sleep(Duration::from_secs_f64(controller.knobs.attempt_recruitment_delay))
            .await;
    }
}

/// Serves one storage-recruitment request, parking it with a deadline when
/// no worker qualifies.
pub fn recruit_storage(controller: &Arc<Controller>, req: RecruitStorageRequest) {
    let ctx = controller.recruit_ctx();
    let mut state = controller.state.write();

    let attempt = if !state.got_process_classes && !req.critical_recruitment {
        Err(Error::NoMoreServers)
    } else {
        state.get_storage_worker(&ctx, &req)
    };

    match attempt {
        Ok((worker, process_class)) => {
            let _ = req.reply.send(Ok(RecruitStorageReply { worker, process_class }));
        }
        Err(Error::NoMoreServers) => {
            warn!("Storage recruitment not satisfiable; parking request");
            let deadline = ctx.now + ctx.knobs.recruitment_timeout;
            state.outstanding_storage.push((req, deadline));
        }
        Err(err) => {
            // Any other error would bring down the controller; surface it
            // to the requester instead of crashing on its behalf.
            error!(error = %err, "Storage recruitment failed");
            let _ = req.reply.send(Err(err));
        }
    }
}

fn check_outstanding_recruitments(controller: &Controller) -> Result<()> {
    let ctx = controller.recruit_ctx();
    let mut state = controller.state.write();

    let pending = std::mem::take(&mut state.outstanding_recruitment);
    for req in pending {
        let result = state.find_workers_for_configuration(
            &ctx,
            &req.configuration,
            req.recruit_seed_servers,
            req.max_old_log_routers,
        );
        match result {
            Ok(reply) => {
                let _ = req.reply.send(Ok(reply));
            }
            Err(Error::NoMoreServers | Error::OperationFailed) => {
                debug!("Parked recruitment still not satisfiable");
                state.outstanding_recruitment.push(req);
            }
            Err(err) => {
                error!(error = %err, "Parked recruitment failed fatally");
                return Err(err);
            }
        }
    }

    let pending = std::mem::take(&mut state.outstanding_remote);
    for req in pending {
        let result = state.find_remote_workers_for_configuration(
            &ctx,
            &req.configuration,
            &req.dc_id,
            req.log_router_count,
        );
        match result {
            Ok(reply) => {
                let _ = req.reply.send(Ok(reply));
            }
            Err(Error::NoMoreServers | Error::OperationFailed) => {
                debug!("Parked remote recruitment still not satisfiable");
                state.outstanding_remote.push(req);
            }
            Err(err) => {
                error!(error = %err, "Parked remote recruitment failed fatally");
                return Err(err);
            }
        }
    }

    let pending = std::mem::take(&mut state.outstanding_storage);
    for (req, deadline) in pending {
        if deadline < ctx.now {
            let _ = req.reply.send(Err(Error::TimedOut));
            continue;
        }
        let attempt = if !state.got_process_classes && !req.critical_recruitment {
            Err(Error::NoMoreServers)
        } else {
            state.get_storage_worker(&ctx, &req)
        };
        match attempt {
            Ok((worker, process_class)) => {
                let _ = req.reply.send(Ok(RecruitStorageReply { worker, process_class }));
            }
            Err(Error::NoMoreServers) => {
                state.outstanding_storage.push((req, deadline));
            }
            Err(err) => {
                error!(error = %err, "Parked storage recruitment failed fatally");
                return Err(err);
            }
        }
    }

    Ok(())
}

/// Runs one full outstanding-work pass: retry parked requests, unstick
/// stalled recoveries, and trigger failover when a better placement
/// exists.
pub fn check_outstanding_requests(controller: &Controller) -> Result<()> {
    check_outstanding_recruitments(controller)?;

    let dbi = controller.server_info.get();
    let ctx = controller.recruit_ctx();
    let mut state = controller.state.write();
    state.check_recovery_stalled(&ctx, &dbi);

    if state.better_master_exists(&ctx, &dbi) {
        if let Some(tx) = state.force_master_failure.take() {
            warn!(
                master = ?dbi.master.as_ref().map(|m| m.id),
                "Better placement exists; forcing master failover"
            );
            counter!("helmsman_forced_failovers").increment(1);
            let _ = tx.send(());
        }
    }

    Ok(())
}

/// Drives [`check_outstanding_requests`] off wake-ups and the periodic
/// tick.
pub async fn check_outstanding_loop(controller: Arc<Controller>) -> Result<()> {
    let interval = Duration::from_secs_f64(controller.knobs.check_outstanding_interval);
    loop {
        tokio::select! {
            _ = controller.outstanding_notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }

        match check_outstanding_requests(&controller) {
            Ok(()) => {}
            Err(err) if err.is_retryable_recruitment() => {}
            Err(err) => {
                error!(error = %err, "Outstanding-request check failed");
                return Err(err);
            }
        }
    }
}
