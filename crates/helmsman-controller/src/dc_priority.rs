//! Two-phase propagation of datacenter priority changes.
//!
//! Workers decide locally whether to exit based on their `dc_fitness`; to
//! keep the cluster stable the controller rolls a priority change out in
//! two debounced phases and walks workers from best controller-fitness to
//! worst, so replacements are always available before incumbents leave.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use helmsman_core::class::{DcFitness, Fitness};
use helmsman_core::error::Result;
use helmsman_core::types::DcId;

use crate::controller::Controller;
use crate::messages::RegisterWorkerReply;

/// Updates one fitness group's workers against `list`; returns true when
/// anything changed.
fn update_group(
    controller: &Controller,
    list: &[Option<DcId>],
    group: Fitness,
    final_pass: bool,
) -> bool {
    let mut state = controller.state.write();
    let controller_process = state.controller_process_id.clone();
    let mut updated = false;

    for (id, worker) in state.id_worker.iter_mut() {
        let in_group = (!worker.priority_info.is_excluded
            && worker.priority_info.process_class_fitness == group)
            || final_pass;
        if !in_group {
            continue;
        }
        let fitness = DcFitness::calculate(worker.interface.locality.dc_id.as_ref(), list);
        if Some(id) != controller_process.as_ref() && worker.priority_info.dc_fitness != fitness {
            updated = true;
            worker.priority_info.dc_fitness = fitness;
            worker.reply.send(RegisterWorkerReply {
                process_class: worker.process_class,
                priority_info: worker.priority_info,
            });
        }
    }
    updated
}

/// Walks all workers from best fitness group to worst, pausing between
/// groups that actually changed.
async fn walk_fitness_groups(controller: &Controller, list: &[Option<DcId>]) {
    let groups: Vec<Fitness> = Fitness::assignable().collect();
    for group in groups {
        if update_group(controller, list, group, false) {
            tokio::time::sleep(Duration::from_secs_f64(controller.knobs.cc_class_delay)).await;
        }
    }
    // Final pass catches excluded and never-assign stragglers.
    update_group(controller, list, Fitness::NeverAssign, true);
}

/// Phase one: react to `desired_dc_ids` changes.
///
/// When the controller's own fitness would improve it updates itself first
/// (it will exit and stand for election from the right datacenter);
/// otherwise it walks the other workers in fitness order.
pub async fn updated_changing_datacenters(controller: Arc<Controller>) -> Result<()> {
    // Give every process a chance to register before shuffling priorities.
    tokio::time::sleep(Duration::from_secs_f64(
        controller.knobs.wait_for_good_recruitment_delay,
    ))
    .await;

    loop {
        let mut desired_rx = controller.desired_dc_ids.subscribe();
        let desired = controller.desired_dc_ids.get();

        match desired {
            None => controller.changing_dc_ids.set((false, None)),
            Some(list) => {
                let own_update = {
                    let mut state = controller.state.write();
                    let controller_process = state.controller_process_id.clone();
                    match controller_process.and_then(|id| state.id_worker.get_mut(&id)) {
                        Some(worker) => {
                            let new_fitness = DcFitness::calculate(
                                worker.interface.locality.dc_id.as_ref(),
                                &list,
                            );
                            let improves = worker.priority_info.dc_fitness > new_fitness;
                            debug!(
                                old = ?worker.priority_info.dc_fitness,
                                new = ?new_fitness,
                                improves,
                                "Datacenter priorities changing"
                            );
                            if improves {
                                worker.priority_info.dc_fitness = new_fitness;
                                let reply = RegisterWorkerReply {
                                    process_class: worker.process_class,
                                    priority_info: worker.priority_info,
                                };
                                worker.reply.send(reply);
                            }
                            Some(improves)
                        }
                        None => None,
                    }
                };

                match own_update {
                    Some(improves) => {
                        controller.changing_dc_ids.set((improves, Some(list.clone())));
                        if !improves {
                            walk_fitness_groups(&controller, &list).await;
                        }
                    }
                    None => {
                        controller.changing_dc_ids.set((false, Some(list.clone())));
                        walk_fitness_groups(&controller, &list).await;
                    }
                }
            }
        }

        let _ = desired_rx.changed().await;
    }
}

/// Phase two: apply the committed priorities after the debounce, in the
/// opposite order when the controller itself is not the one moving.
pub async fn updated_changed_datacenters(controller: Arc<Controller>) -> Result<()> {
    let mut changing_rx = controller.changing_dc_ids.subscribe();
    let mut change_delay: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = Some(Box::pin(
        tokio::time::sleep(Duration::from_secs_f64(controller.knobs.cc_change_delay)),
    ));

    loop {
        tokio::select! {
            _ = changing_rx.changed() => {
                change_delay = Some(Box::pin(tokio::time::sleep(Duration::from_secs_f64(
                    controller.knobs.cc_change_delay,
                ))));
            }
            _ = async {
                match change_delay.as_mut() {
                    Some(delay) => delay.await,
                    None => std::future::pending().await,
                }
            } => {
                change_delay = None;
                let changing = controller.changing_dc_ids.get();
                controller.changed_dc_ids.set(changing.clone());

                if let (controller_first, Some(list)) = changing {
                    info!(controller_first, "Committing datacenter priorities");
                    if !controller_first {
                        let mut state = controller.state.write();
                        let controller_process = state.controller_process_id.clone();
                        if let Some(worker) =
                            controller_process.and_then(|id| state.id_worker.get_mut(&id))
                        {
                            let new_fitness = DcFitness::calculate(
                                worker.interface.locality.dc_id.as_ref(),
                                &list,
                            );
                            if worker.priority_info.dc_fitness != new_fitness {
                                worker.priority_info.dc_fitness = new_fitness;
                                let reply = RegisterWorkerReply {
                                    process_class: worker.process_class,
                                    priority_info: worker.priority_info,
                                };
                                worker.reply.send(reply);
                            }
                        }
                    } else {
                        walk_fitness_groups(&controller, &list).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use helmsman_core::class::{ClassSource, ClassType, PriorityInfo, ProcessClass};
    use helmsman_core::knobs::Knobs;
    use helmsman_core::types::Locality;

    use crate::store::MemoryStore;
    use crate::version_lag::NoOpLogMetricsSource;

    #[tokio::test]
    async fn test_walk_updates_dc_fitness_and_pushes() {
        let controller = Controller::new(
            "10.0.0.1:4500".parse().unwrap(),
            Locality::new("cc").with_dc("east"),
            Arc::new(Knobs::default()),
            MemoryStore::new(),
            Arc::new(NoOpLogMetricsSource),
        );

        let (interface, _endpoints) = crate::messages::WorkerInterface::new(
            "10.0.0.2:4500".parse().unwrap(),
            Locality::new("p1").with_dc("west"),
        );
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        crate::registry::register_worker(
            &controller,
            crate::messages::RegisterWorkerRequest {
                interface,
                initial_class: ProcessClass::new(ClassType::Stateless, ClassSource::CommandLine),
                process_class: ProcessClass::new(ClassType::Stateless, ClassSource::CommandLine),
                priority_info: PriorityInfo::default(),
                generation: 1,
                reply: reply_tx,
            },
        );

        let list = vec![Some(DcId::new("west")), Some(DcId::new("east"))];
        walk_fitness_groups(&controller, &list).await;

        let pushed = reply_rx.await.unwrap();
        assert_eq!(pushed.priority_info.dc_fitness, DcFitness::Primary);
    }
}
