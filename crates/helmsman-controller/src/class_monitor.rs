//! Keeps worker classes fresh from the system keyspace, and republishes
//! client sampling knobs when operators change them.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use helmsman_core::class::{ClassSource, ClassType, ProcessClass, Role};
use helmsman_core::error::Result;
use helmsman_core::types::ProcessId;

use crate::controller::Controller;
use crate::messages::RegisterWorkerReply;
use crate::store::{self, Mutation};

/// Pulls declared classes from the system keyspace and pushes changed
/// priorities to affected workers; loops on the change-key watch.
pub async fn monitor_process_classes(controller: Arc<Controller>) -> Result<()> {
    let store = controller.store.clone();
    let retry_delay = controller.knobs.store_retry_delay;

    // One-time schema migration: stamp the version key if absent.
    store::retry(retry_delay, || {
        let store = store.clone();
        async move {
            if store.get(store::PROCESS_CLASS_VERSION_KEY).await?.is_none() {
                info!("Writing process-class schema version");
                store
                    .apply(vec![Mutation::Set(
                        store::PROCESS_CLASS_VERSION_KEY.to_string(),
                        store::PROCESS_CLASS_VERSION_VALUE.as_bytes().to_vec(),
                    )])
                    .await?;
            }
            Ok(())
        }
    })
    .await;

    loop {
        let entries = store::retry(retry_delay, || {
            let store = store.clone();
            async move { store.get_range(store::PROCESS_CLASS_PREFIX).await }
        })
        .await;

        let mut id_class: HashMap<ProcessId, ProcessClass> = HashMap::new();
        for (key, value) in &entries {
            let process_id = ProcessId::new(&key[store::PROCESS_CLASS_PREFIX.len()..]);
            match serde_json::from_slice::<ProcessClass>(value) {
                Ok(class) if class.source != ClassSource::CommandLine => {
                    id_class.insert(process_id, class);
                }
                Ok(class) => {
                    warn!(process = %process_id, class = %class.class_type, "Ignoring command-line-sourced class override");
                }
                Err(err) => {
                    warn!(process = %process_id, error = %err, "Undecodable process-class value");
                }
            }
        }

        {
            let mut state = controller.state.write();
            if id_class != state.id_class || !state.got_process_classes {
                state.id_class = id_class;

                let overrides = state.id_class.clone();
                for (id, worker) in state.id_worker.iter_mut() {
                    let new_class = match overrides.get(id) {
                        Some(over)
                            if over.source == ClassSource::Database
                                || worker.initial_class.class_type == ClassType::Unset =>
                        {
                            *over
                        }
                        _ => worker.initial_class,
                    };

                    if new_class != worker.process_class {
                        debug!(process = %id, class = %new_class.class_type, "Worker class changed");
                        worker.process_class = new_class;
                        worker.priority_info.process_class_fitness =
                            new_class.role_fitness(Role::ClusterController);
                        worker.reply.send(RegisterWorkerReply {
                            process_class: worker.process_class,
                            priority_info: worker.priority_info,
                        });
                    }
                }

                state.got_process_classes = true;
                drop(state);
                controller.notify_outstanding_check();
            }
        }

        store::retry(retry_delay, || {
            let store = store.clone();
            async move { store.watch(store::PROCESS_CLASS_CHANGE_KEY).await }
        })
        .await;
    }
}

/// Watches the client transaction-sampling keys and republishes
/// `ClientDBInfo` when they change.
pub async fn monitor_client_txn_configs(controller: Arc<Controller>) -> Result<()> {
    let store = controller.store.clone();
    let retry_delay = controller.knobs.store_retry_delay;

    loop {
        let (rate, limit) = store::retry(retry_delay, || {
            let store = store.clone();
            async move {
                let rate = store.get(store::CLIENT_TXN_SAMPLE_RATE_KEY).await?;
                let limit = store.get(store::CLIENT_TXN_SIZE_LIMIT_KEY).await?;
                Ok((rate, limit))
            }
        })
        .await;

        let sample_rate = rate
            .as_deref()
            .and_then(|v| serde_json::from_slice::<f64>(v).ok())
            .unwrap_or(f64::INFINITY);
        let size_limit =
            limit.as_deref().and_then(|v| serde_json::from_slice::<i64>(v).ok()).unwrap_or(-1);

        let current = controller.client_info.get();
        if sample_rate != current.client_txn_info_sample_rate
            || size_limit != current.client_txn_info_size_limit
        {
            let mut info = current;
            info.id = Uuid::new_v4();
            info.client_txn_info_sample_rate = sample_rate;
            info.client_txn_info_size_limit = size_limit;
            info!(sample_rate, size_limit, "Publishing new client sampling knobs");
            controller.client_info.set(info);
        }

        let rate_watch = {
            let store = store.clone();
            async move { store.watch(store::CLIENT_TXN_SAMPLE_RATE_KEY).await }
        };
        let limit_watch = {
            let store = store.clone();
            async move { store.watch(store::CLIENT_TXN_SIZE_LIMIT_KEY).await }
        };
        tokio::select! {
            _ = rate_watch => {}
            _ = limit_watch => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use helmsman_core::class::{ClassSource, ClassType, ProcessClass};
    use helmsman_core::knobs::Knobs;
    use helmsman_core::types::Locality;

    use crate::controller::Controller;
    use crate::store::{self, MemoryStore, Mutation, SystemStore};
    use crate::version_lag::NoOpLogMetricsSource;

    #[tokio::test]
    async fn test_class_overrides_applied_to_workers() {
        let store = MemoryStore::new();
        let controller = Controller::new(
            "10.0.0.1:4500".parse().unwrap(),
            Locality::new("cc"),
            Arc::new(Knobs::default()),
            store.clone(),
            Arc::new(NoOpLogMetricsSource),
        );

        // Register a worker with storage class.
        let (interface, _endpoints) = crate::messages::WorkerInterface::new(
            "10.0.0.2:4500".parse().unwrap(),
            Locality::new("p1"),
        );
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        crate::registry::register_worker(
            &controller,
            crate::messages::RegisterWorkerRequest {
                interface,
                initial_class: ProcessClass::new(ClassType::Storage, ClassSource::CommandLine),
                process_class: ProcessClass::new(ClassType::Storage, ClassSource::CommandLine),
                priority_info: Default::default(),
                generation: 1,
                reply: reply_tx,
            },
        );

        // Publish a database-sourced override and run the monitor until it
        // has applied one round.
        let class = ProcessClass::new(ClassType::TLog, ClassSource::Database);
        store
            .apply(vec![Mutation::Set(
                store::process_class_key(&"p1".into()),
                serde_json::to_vec(&class).unwrap(),
            )])
            .await
            .unwrap();

        let monitor = tokio::spawn(super::monitor_process_classes(controller.clone()));
        let pushed = reply_rx.await.unwrap();
        monitor.abort();

        assert_eq!(pushed.process_class.class_type, ClassType::TLog);
        let state = controller.state.read();
        assert!(state.got_process_classes);
        assert_eq!(
            state.id_worker[&helmsman_core::types::ProcessId::from("p1")]
                .process_class
                .class_type,
            ClassType::TLog
        );
    }
}
