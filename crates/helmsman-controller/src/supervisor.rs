//! The master supervision loop: recruit a master, watch it, fail over.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use helmsman_core::class::{Fitness, Role};
use helmsman_core::error::{Error, Result};

use crate::controller::Controller;
use crate::dbinfo::ServerDBInfo;
use crate::messages::RecruitMasterRequest;
use crate::recruit::IdUsed;

/// Waits until `address` has been continuously unavailable for
/// `reaction_time` seconds.
async fn wait_failure(controller: &Controller, address: std::net::SocketAddr, reaction_time: f64) {
    let poll = Duration::from_secs_f64((reaction_time / 2.0).clamp(0.05, 1.0));
    let mut unavailable_since: Option<f64> = None;
    loop {
        let now = controller.clock.now();
        if controller.detector.is_available(address) {
            unavailable_since = None;
        } else {
            let since = *unavailable_since.get_or_insert(now);
            if now - since >= reaction_time {
                return;
            }
        }
        tokio::time::sleep(poll).await;
    }
}

/// Recruits and supervises masters until the controller shuts down.
///
/// The failure reaction on the master is steep once it has registered and
/// shallow during a long recovery, so slow recoveries are not restarted
/// from scratch by an impatient watchdog.
pub async fn cluster_watch_database(controller: Arc<Controller>) -> Result<()> {
    loop {
        let recovery_start = controller.clock.now();
        debug!("Recruiting a master");

        // The master co-locates with the controller's datacenter, so wait
        // until our own registration has told us where that is.
        loop {
            if controller.state.read().controller_process_id.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_secs_f64(
                controller.knobs.attempt_recruitment_delay,
            ))
            .await;
        }

        let candidate = {
            let ctx = controller.recruit_ctx();
            let mut state = controller.state.write();
            let mut id_used = IdUsed::new();
            if let Some(cc) = state.controller_process_id.clone() {
                *id_used.entry(cc).or_default() += 1;
            }
            let dc = state.controller_dc_id.clone();
            let config = state.db.config.clone();
            state.get_worker_for_role_in_datacenter(
                &ctx,
                dc.as_ref(),
                Role::Master,
                Fitness::NeverAssign,
                &config,
                &mut id_used,
                false,
            )
        };

        let candidate = match candidate {
            Ok(candidate) => candidate,
            Err(Error::NoMoreServers) => {
                tokio::time::sleep(Duration::from_secs_f64(controller.knobs.master_spin_delay))
                    .await;
                continue;
            }
            Err(err) => return Err(err),
        };

        // Within the grace window, hold out for a dedicated master that is
        // not sharing our process.
        let (fitness, on_controller) = {
            let state = controller.state.read();
            (
                candidate.worker.1.role_fitness(Role::Master),
                Some(&candidate.worker.0.locality.process_id) == state.controller_process_id.as_ref(),
            )
        };
        let within_grace = {
            let state = controller.state.read();
            controller.clock.now() - state.start_time
                < controller.knobs.wait_for_good_recruitment_delay
        };
        if (fitness > controller.knobs.expected_master_fitness || on_controller) && within_grace {
            debug!(?fitness, on_controller, "Master candidate not good enough yet");
            tokio::time::sleep(Duration::from_secs_f64(
                controller.knobs.attempt_recruitment_delay,
            ))
            .await;
            continue;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = RecruitMasterRequest {
            lifetime: controller.server_info.get().master_lifetime,
            force_recovery: controller.state.read().db.force_recovery,
            reply: reply_tx,
        };

        {
            let mut state = controller.state.write();
            state.master_process_id = Some(candidate.worker.0.locality.process_id.clone());
            state.db.unfinished_recoveries += 1;
            controller
                .detector
                .set_stacked_generations(state.db.unfinished_recoveries.max(state.db.log_generations));
        }

        if candidate.worker.0.master.send(request).await.is_err() {
            warn!(worker = %candidate.worker.0.id, "Master recruit endpoint gone");
            tokio::time::sleep(Duration::from_secs_f64(controller.knobs.master_spin_delay)).await;
            continue;
        }

        let master = match reply_rx.await {
            Ok(master) => master,
            Err(_) => {
                // The worker dropped the reply; treat like a failed
                // recruitment and spin.
                warn!(worker = %candidate.worker.0.id, "Master recruitment reply broken");
                tokio::time::sleep(Duration::from_secs_f64(controller.knobs.master_spin_delay))
                    .await;
                continue;
            }
        };

        info!(master = %master.id, address = %master.address, "Recruited master");

        let force_failure = {
            let mut state = controller.state.write();
            state.db.master_registration_count = 0;
            state.db.recovery_stalled = false;
            state.db.force_recovery = false;
            let (tx, rx) = oneshot::channel();
            state.force_master_failure = Some(tx);
            rx
        };

        let mut info = ServerDBInfo::new(controller.id);
        info.id = Uuid::new_v4();
        info.master = Some(master.clone());
        info.master_lifetime = controller.server_info.get().master_lifetime.advanced();
        controller.server_info.set(info);

        // Don't retry recovery more than once per spin delay, but don't
        // delay the first recovery after a stretch of normal operation.
        tokio::time::sleep(Duration::from_secs_f64(controller.knobs.master_spin_delay)).await;

        debug!(master = %master.id, "Watching master");
        let mut force_failure = force_failure;
        loop {
            let reaction_time = {
                let state = controller.state.read();
                if state.db.master_registration_count > 0 {
                    controller.knobs.master_failure_reaction_time
                } else {
                    (controller.clock.now() - recovery_start)
                        * controller.knobs.master_failure_slope_during_recovery
                }
            };

            tokio::select! {
                _ = wait_failure(&controller, master.address, reaction_time.max(0.05)) => {
                    warn!(master = %master.id, "Detected failed master");
                    break;
                }
                result = &mut force_failure => {
                    match result {
                        Ok(()) => warn!(master = %master.id, "Master failover forced"),
                        // The sender was replaced without firing; treat as
                        // a forced restart rather than crashing.
                        Err(_) => warn!(master = %master.id, "Force-failure channel dropped"),
                    }
                    break;
                }
                _ = controller.server_info.on_change() => {
                    // Re-derive the reaction time from the new state.
                }
            }
        }
    }
}
