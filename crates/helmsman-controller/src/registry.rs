//! The worker registry: registration, availability watches, and the
//! persisted worker list.

use std::sync::Arc;

use tracing::{debug, info, trace};

use helmsman_core::class::{ClassSource, ClassType, DcFitness, Role};
use helmsman_core::error::Result;
use helmsman_core::sync::ReplySlot;
use helmsman_core::types::ProcessId;

use crate::controller::Controller;
use crate::messages::{RegisterWorkerReply, RegisterWorkerRequest, WorkerInterface};
use crate::state::WorkerInfo;
use crate::store::{self, Mutation, ProcessData, SystemStore};

/// Handles a worker (re-)registration.
///
/// Acceptance rule: a record is created when none exists; an existing
/// record is superseded when the interface id changed or the generation is
/// at least as new. Every accepted registration recomputes the effective
/// class and priority info, and pushes the result back only when it
/// differs from what the worker reported.
pub fn register_worker(controller: &Arc<Controller>, req: RegisterWorkerRequest) {
    let interface = req.interface.clone();
    let process_id = interface.locality.process_id.clone();
    let mut new_process_class = req.process_class;
    let mut new_priority = req.priority_info;

    let mut state = controller.state.write();

    let known = state.id_worker.contains_key(&process_id);
    if known {
        trace!(
            worker = %interface.id,
            process = %process_id,
            class = %req.process_class.class_type,
            workers = state.id_worker.len(),
            "Worker re-registered"
        );
    } else {
        info!(
            worker = %interface.id,
            process = %process_id,
            zone = ?interface.locality.zone_id,
            dc = ?interface.locality.dc_id,
            class = %req.process_class.class_type,
            workers = state.id_worker.len(),
            "Worker registered"
        );
    }

    // Datacenter fitness follows whichever priority list is currently
    // being rolled out: the controller itself moves on the first phase,
    // everyone else on the second.
    let is_controller_process = interface.address == controller.address;
    if is_controller_process {
        state.controller_process_id = Some(process_id.clone());
        state.controller_dc_id = interface.locality.dc_id.clone();
    }
    let changing = controller.changing_dc_ids.get();
    let changed = controller.changed_dc_ids.get();
    let phase_list = if is_controller_process == changing.0 {
        changing.1.as_ref().map(|l| l.as_slice())
    } else {
        changed.1.as_ref().map(|l| l.as_slice())
    };
    if let Some(list) = phase_list {
        new_priority.dc_fitness = DcFitness::calculate(interface.locality.dc_id.as_ref(), list);
    }

    let existing = state.id_worker.get(&process_id);
    let accepted = match existing {
        None => true,
        Some(info) => info.interface.id != interface.id || req.generation >= info.generation,
    };

    let mut reply_slot = ReplySlot::new(req.reply);

    if accepted {
        if state.got_process_classes {
            let class_override = state.id_class.get(&process_id);
            new_process_class = match class_override {
                Some(over)
                    if over.source == ClassSource::Database
                        || req.initial_class.class_type == ClassType::Unset =>
                {
                    *over
                }
                _ => req.initial_class,
            };
            new_priority.process_class_fitness =
                new_process_class.role_fitness(Role::ClusterController);
        }

        if state.got_fully_recovered_config {
            new_priority.is_excluded = state
                .db
                .fully_recovered_config
                .as_ref()
                .is_some_and(|conf| conf.is_excluded_server(interface.address));
        }

        // Tell the worker to adopt the corrected class and priority.
        if new_process_class != req.process_class || new_priority != req.priority_info {
            reply_slot.send(RegisterWorkerReply {
                process_class: new_process_class,
                priority_info: new_priority,
            });
        }
    }

    match state.id_worker.get_mut(&process_id) {
        None => {
            let watcher =
                tokio::spawn(worker_availability_watch(controller.clone(), interface.clone()));
            state.id_worker.insert(
                process_id.clone(),
                WorkerInfo {
                    watcher: Some(watcher),
                    reply: reply_slot,
                    generation: req.generation,
                    reboots: 0,
                    last_available_time: controller.clock.now(),
                    interface: interface.clone(),
                    initial_class: req.initial_class,
                    process_class: new_process_class,
                    priority_info: new_priority,
                },
            );
            state.set_worker_list(
                process_id,
                Some(ProcessData {
                    locality: interface.locality.clone(),
                    process_class: new_process_class,
                    address: interface.address,
                }),
            );
            controller.worker_list_dirty.set(true);
            drop(state);
            controller.notify_outstanding_check();
        }
        Some(info) if accepted => {
            let interface_changed = info.interface.id != interface.id;

            // Cancel any stale pending reply so the worker never acts on
            // outdated priority data, then install the fresh one.
            info.reply = reply_slot;
            info.process_class = new_process_class;
            info.priority_info = new_priority;
            info.initial_class = req.initial_class;
            info.generation = req.generation;

            if interface_changed {
                info.abort_watcher();
                info.interface = interface.clone();
                info.watcher = Some(tokio::spawn(worker_availability_watch(
                    controller.clone(),
                    interface,
                )));
            }
            drop(state);
            controller.notify_outstanding_check();
        }
        Some(_) => {
            debug!(process = %process_id, generation = req.generation, "Stale worker registration ignored");
        }
    }
}

/// Watches one worker interface: counts reboots when it bounces back, and
/// removes the record when the failure monitor declares it dead.
async fn worker_availability_watch(controller: Arc<Controller>, worker: WorkerInterface) {
    let own_process = worker.address == controller.address;
    let mut events = controller.detector.subscribe();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };
        if event.address != worker.address {
            continue;
        }

        if event.status.is_available() {
            tokio::spawn(reboot_and_check(
                controller.clone(),
                worker.locality.process_id.clone(),
            ));
            controller.notify_outstanding_check();
        } else if !own_process {
            // The controller's own worker record outlives monitor noise.
            let mut state = controller.state.write();
            if let Some(mut info) = state.id_worker.remove(&worker.locality.process_id) {
                if info.interface.id != worker.id {
                    // A newer interface took over this process id; put it
                    // back untouched.
                    state.id_worker.insert(worker.locality.process_id.clone(), info);
                    return;
                }
                let reply = RegisterWorkerReply {
                    process_class: info.process_class,
                    priority_info: info.priority_info,
                };
                info.reply.send(reply);
                info!(process = %worker.locality.process_id, address = %worker.address, "Worker removed after failure");
            }
            state.set_worker_list(worker.locality.process_id.clone(), None);
            controller.worker_list_dirty.set(true);
            drop(state);
            controller.notify_outstanding_check();
            return;
        }
    }
}

/// Counts one reboot, then forgets it after the hysteresis window.
async fn reboot_and_check(controller: Arc<Controller>, process_id: ProcessId) {
    {
        let mut state = controller.state.write();
        let now = controller.clock.now();
        if let Some(info) = state.id_worker.get_mut(&process_id) {
            info.last_available_time = now;
            info.reboots += 1;
        }
    }

    tokio::time::sleep(std::time::Duration::from_secs_f64(controller.knobs.shutdown_timeout))
        .await;

    let mut state = controller.state.write();
    if let Some(info) = state.id_worker.get_mut(&process_id) {
        info.reboots -= 1;
        let stable_again = info.reboots < 2;
        drop(state);
        if stable_again {
            controller.notify_outstanding_check();
        }
    }
}

/// Drains worker-list deltas into the system keyspace.
///
/// The list is cleared and rebuilt at startup, then maintained with
/// last-write-wins batches as workers come and go.
pub async fn update_worker_list(controller: Arc<Controller>) -> Result<()> {
    let store: Arc<dyn SystemStore> = controller.store.clone();
    let retry_delay = controller.knobs.store_retry_delay;

    store::retry(retry_delay, || {
        let store = store.clone();
        async move {
            store
                .apply(vec![Mutation::ClearRange(
                    store::WORKER_LIST_PREFIX.to_string(),
                    format!("{}\u{10FFFF}", store::WORKER_LIST_PREFIX),
                )])
                .await
        }
    })
    .await;

    let mut dirty_rx = controller.worker_list_dirty.subscribe();
    loop {
        while !controller.worker_list_dirty.get() {
            let _ = dirty_rx.changed().await;
        }
        controller.worker_list_dirty.set(false);

        let delta = {
            let mut state = controller.state.write();
            std::mem::take(&mut state.worker_list_delta)
        };
        if delta.is_empty() {
            continue;
        }
        debug!(delta = delta.len(), "Writing worker-list changes");

        let mutations: Vec<Mutation> = delta
            .iter()
            .map(|(id, data)| match data {
                Some(data) => Mutation::Set(
                    store::worker_list_key(id),
                    serde_json::to_vec(data).unwrap_or_default(),
                ),
                None => Mutation::Clear(store::worker_list_key(id)),
            })
            .collect();

        store::retry(retry_delay, || {
            let store = store.clone();
            let mutations = mutations.clone();
            async move { store.apply(mutations).await }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use helmsman_core::class::{ClassSource, ClassType, PriorityInfo, ProcessClass};
    use helmsman_core::knobs::Knobs;
    use helmsman_core::types::{Locality, ProcessId};

    use crate::controller::Controller;
    use crate::messages::{RegisterWorkerRequest, WorkerInterface};
    use crate::store::MemoryStore;
    use crate::version_lag::NoOpLogMetricsSource;

    fn test_controller() -> Arc<Controller> {
        Controller::new(
            "10.0.0.1:4500".parse().unwrap(),
            Locality::new("cc").with_dc("dc1"),
            Arc::new(Knobs::default()),
            MemoryStore::new(),
            Arc::new(NoOpLogMetricsSource),
        )
    }

    fn register(
        controller: &Arc<Controller>,
        process: &str,
        addr: &str,
        generation: u64,
    ) -> (WorkerInterface, oneshot::Receiver<crate::messages::RegisterWorkerReply>) {
        let address: SocketAddr = addr.parse().unwrap();
        let (interface, _endpoints) =
            WorkerInterface::new(address, Locality::new(process).with_dc("dc1").with_zone("z1"));
        let (reply_tx, reply_rx) = oneshot::channel();
        super::register_worker(
            controller,
            RegisterWorkerRequest {
                interface: interface.clone(),
                initial_class: ProcessClass::new(ClassType::Storage, ClassSource::CommandLine),
                process_class: ProcessClass::new(ClassType::Storage, ClassSource::CommandLine),
                priority_info: PriorityInfo::default(),
                generation,
                reply: reply_tx,
            },
        );
        (interface, reply_rx)
    }

    #[tokio::test]
    async fn test_first_registration_inserts() {
        let controller = test_controller();
        register(&controller, "p1", "10.0.0.2:4500", 1);

        let state = controller.state.read();
        assert_eq!(state.id_worker.len(), 1);
        let info = &state.id_worker[&ProcessId::from("p1")];
        assert_eq!(info.generation, 1);
    }

    #[tokio::test]
    async fn test_stale_generation_ignored() {
        let controller = test_controller();
        let (first, _) = register(&controller, "p1", "10.0.0.2:4500", 5);
        // Same interface, older generation: dropped.
        let (reply_tx, _reply_rx) = oneshot::channel();
        super::register_worker(
            &controller,
            RegisterWorkerRequest {
                interface: first.clone(),
                initial_class: ProcessClass::unset(),
                process_class: ProcessClass::unset(),
                priority_info: PriorityInfo::default(),
                generation: 3,
                reply: reply_tx,
            },
        );

        let state = controller.state.read();
        let info = &state.id_worker[&ProcessId::from("p1")];
        assert_eq!(info.generation, 5);
        assert_eq!(info.process_class.class_type, ClassType::Storage);
    }

    #[tokio::test]
    async fn test_newer_generation_supersedes() {
        let controller = test_controller();
        register(&controller, "p1", "10.0.0.2:4500", 1);
        register(&controller, "p1", "10.0.0.2:4500", 2);

        let state = controller.state.read();
        assert_eq!(state.id_worker.len(), 1);
        assert_eq!(state.id_worker[&ProcessId::from("p1")].generation, 2);
    }

    #[tokio::test]
    async fn test_replacement_cancels_stale_reply() {
        let controller = test_controller();
        let (_, old_reply) = register(&controller, "p1", "10.0.0.2:4500", 1);
        register(&controller, "p1", "10.0.0.2:4500", 2);

        // The first registration's pending reply is canceled, never
        // resolved with stale data.
        assert!(old_reply.await.is_err());
    }

    #[tokio::test]
    async fn test_controller_process_recorded() {
        let controller = test_controller();
        register(&controller, "cc", "10.0.0.1:4500", 1);

        let state = controller.state.read();
        assert_eq!(state.controller_process_id, Some("cc".into()));
        assert_eq!(state.controller_dc_id, Some("dc1".into()));
    }

    #[tokio::test]
    async fn test_database_class_override_wins() {
        let controller = test_controller();
        {
            let mut state = controller.state.write();
            state.got_process_classes = true;
            state.id_class.insert(
                "p1".into(),
                ProcessClass::new(ClassType::TLog, ClassSource::Database),
            );
        }
        let (_, reply) = register(&controller, "p1", "10.0.0.2:4500", 1);

        let state = controller.state.read();
        assert_eq!(state.id_worker[&ProcessId::from("p1")].process_class.class_type, ClassType::TLog);
        drop(state);

        // The worker reported storage class, so the correction is pushed.
        let pushed = reply.await.unwrap();
        assert_eq!(pushed.process_class.class_type, ClassType::TLog);
    }

    #[tokio::test]
    async fn test_worker_list_delta_written() {
        let controller = test_controller();
        register(&controller, "p1", "10.0.0.2:4500", 1);
        let state = controller.state.read();
        assert!(state.worker_list_delta.contains_key(&ProcessId::from("p1")));
        assert!(state.worker_list_delta[&ProcessId::from("p1")].is_some());
    }

    #[tokio::test]
    async fn test_worker_list_round_trip() {
        let controller = test_controller();
        let store = {
            // The writer task persists deltas into the controller's store.
            let writer = tokio::spawn(super::update_worker_list(controller.clone()));
            register(&controller, "p1", "10.0.0.2:4500", 1);
            register(&controller, "p2", "10.0.0.3:4500", 1);
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            writer.abort();
            controller.store.clone()
        };

        let entries = store.get_range(crate::store::WORKER_LIST_PREFIX).await.unwrap();
        assert_eq!(entries.len(), 2);
        for (key, value) in entries {
            let data: crate::store::ProcessData = serde_json::from_slice(&value).unwrap();
            assert!(key.ends_with(data.locality.process_id.as_str()));
        }
    }
}
