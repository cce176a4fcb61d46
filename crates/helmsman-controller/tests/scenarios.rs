//! End-to-end scenarios against a running controller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use helmsman_core::class::{ClassSource, ClassType, PriorityInfo, ProcessClass};
use helmsman_core::knobs::Knobs;
use helmsman_core::types::Locality;
use helmsman_controller::controller::{controller_channels, run_cluster_controller, Controller, ControllerHandle};
use helmsman_controller::messages::{
    RecruitFromConfigurationRequest, RegisterWorkerRequest, WorkerInterface,
};
use helmsman_controller::store::MemoryStore;
use helmsman_controller::version_lag::NoOpLogMetricsSource;
use helmsman_placement::config::DatabaseConfiguration;
use helmsman_placement::policy::ReplicationPolicy;

const CC_ADDR: &str = "10.0.0.1:4500";

fn test_knobs() -> Knobs {
    Knobs {
        // Accept merely-feasible placements immediately, check the parked
        // queues aggressively, and keep the startup grace window wide so
        // registered workers count as available without polling.
        wait_for_good_recruitment_delay: 0.0,
        check_outstanding_interval: 0.05,
        master_spin_delay: 0.05,
        attempt_recruitment_delay: 0.01,
        server_request_interval: 5.0,
        ..Knobs::default()
    }
}

fn start_controller(knobs: Knobs) -> (Arc<Controller>, ControllerHandle, oneshot::Sender<()>) {
    let (handle, requests) = controller_channels();
    let controller = Controller::new(
        CC_ADDR.parse().unwrap(),
        Locality::new("cc").with_zone("zcc").with_dc("dc1"),
        Arc::new(knobs),
        MemoryStore::new(),
        Arc::new(NoOpLogMetricsSource),
    );
    let (leader_tx, leader_rx) = oneshot::channel();
    tokio::spawn(run_cluster_controller(controller.clone(), requests, leader_rx));
    (controller, handle, leader_tx)
}

async fn register_worker(
    handle: &ControllerHandle,
    address: &str,
    process: &str,
    zone: &str,
    class_type: ClassType,
) -> (WorkerInterface, helmsman_controller::messages::WorkerEndpoints) {
    let address: SocketAddr = address.parse().unwrap();
    let locality = Locality::new(process).with_zone(zone).with_dc("dc1");
    let (interface, endpoints) = WorkerInterface::new(address, locality);
    let class = ProcessClass::new(class_type, ClassSource::CommandLine);
    let (reply_tx, _reply_rx) = oneshot::channel();
    handle
        .register_worker
        .send(RegisterWorkerRequest {
            interface: interface.clone(),
            initial_class: class,
            process_class: class,
            priority_info: PriorityInfo::default(),
            generation: 1,
            reply: reply_tx,
        })
        .await
        .unwrap();
    (interface, endpoints)
}

fn two_zone_config() -> DatabaseConfiguration {
    DatabaseConfiguration {
        tlog_replication_factor: 2,
        desired_logs: 2,
        desired_proxies: 1,
        desired_resolvers: 1,
        tlog_policy: ReplicationPolicy::across_zones(2),
        ..DatabaseConfiguration::single()
    }
}

#[tokio::test]
async fn parked_recruitment_completes_when_policy_becomes_satisfiable() {
    let (_controller, handle, _leader) = start_controller(test_knobs());

    // The controller's own process registers first so recruitment knows
    // its datacenter. It shares the only populated zone, so it cannot
    // rescue the two-zone policy either.
    let _cc = register_worker(&handle, CC_ADDR, "cc", "z1", ClassType::Stateless).await;

    // Three logs, all in one zone: a two-zone policy cannot be satisfied.
    for i in 0..3 {
        register_worker(
            &handle,
            &format!("10.0.0.2:{}", 4500 + i),
            &format!("t{i}"),
            "z1",
            ClassType::TLog,
        )
        .await;
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .recruit_from_configuration
        .send(RecruitFromConfigurationRequest {
            configuration: two_zone_config(),
            recruit_seed_servers: false,
            max_old_log_routers: 0,
            reply: reply_tx,
        })
        .await
        .unwrap();

    // The request parks rather than failing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A fourth log in a fresh zone makes the policy satisfiable; the
    // parked request completes on the next outstanding-work pass.
    register_worker(&handle, "10.0.0.3:4500", "t3", "z2", ClassType::TLog).await;

    let reply = timeout(Duration::from_secs(5), reply_rx)
        .await
        .expect("parked recruitment never completed")
        .unwrap()
        .unwrap();

    assert_eq!(reply.tlogs.len(), 2);
    let zones: std::collections::HashSet<_> =
        reply.tlogs.iter().filter_map(|w| w.locality.zone_id.clone()).collect();
    assert_eq!(zones.len(), 2);
    assert_eq!(reply.proxies.len(), 1);
    assert_eq!(reply.resolvers.len(), 1);
}

#[tokio::test]
async fn supervisor_recruits_and_installs_master() {
    let (controller, handle, _leader) = start_controller(test_knobs());

    // The master-class worker registers before the controller's own
    // process: the supervisor only starts recruiting once it knows which
    // process it runs on, so the dedicated master is already in the pool.
    let (worker, mut endpoints) =
        register_worker(&handle, "10.0.0.5:4500", "m0", "zm", ClassType::Master).await;
    let _cc = register_worker(&handle, CC_ADDR, "cc", "zcc", ClassType::Stateless).await;

    // Minimal worker runtime: answer master recruitment with an interface.
    let worker_clone = worker.clone();
    tokio::spawn(async move {
        while let Some(req) = endpoints.master.recv().await {
            let _ = req.reply.send(helmsman_controller::messages::MasterInterface {
                id: uuid::Uuid::new_v4(),
                address: worker_clone.address,
                locality: worker_clone.locality.clone(),
            });
        }
    });

    // The supervisor should recruit the master-class worker and publish it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let info = controller.server_info.get();
        if let Some(master) = info.master {
            assert_eq!(master.address, worker.address);
            assert!(info.master_lifetime.lifetime > 0);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "master never installed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn losing_leadership_stops_the_controller() {
    let (controller, handle, leader) = start_controller(test_knobs());
    let _cc = register_worker(&handle, CC_ADDR, "cc", "zcc", ClassType::Stateless).await;

    leader.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The controller's tasks are gone; a long-poll with a stale id gets no
    // serving task, so the send side sees a full or closed channel
    // eventually. The cheapest observable effect is that the server info
    // stops changing.
    let before = controller.server_info.get().id;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.server_info.get().id, before);
}
