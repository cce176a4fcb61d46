//! Helmsman: the cluster controller process.
//!
//! `helmsman serve` brings up a self-contained single-process controller:
//! it hosts the failure-detection service, registers its own process as a
//! worker, and answers master recruitment locally. Multi-process clusters
//! wire the same controller behind their coordination layer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use helmsman_controller::controller::{controller_channels, run_cluster_controller, Controller};
use helmsman_controller::messages::{
    MasterInterface, RegisterWorkerRequest, WorkerEndpoints, WorkerInterface,
};
use helmsman_controller::store::MemoryStore;
use helmsman_controller::version_lag::NoOpLogMetricsSource;
use helmsman_core::class::{ClassSource, ClassType, PriorityInfo, ProcessClass};
use helmsman_core::knobs::Knobs;
use helmsman_core::types::Locality;

mod cli;

use cli::{Cli, Commands, ServeArgs};

/// On-disk configuration for a controller process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct Config {
    /// Address to announce.
    bind: Option<SocketAddr>,
    /// Stable process identifier.
    process_id: Option<String>,
    /// Locality attributes.
    locality: LocalityConfig,
    /// Declared process class.
    class: Option<String>,
    /// Log filter, e.g. `info` or `helmsman=debug`.
    log_level: String,
    /// Operator-tunable knobs.
    knobs: Knobs,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct LocalityConfig {
    dc: Option<String>,
    zone: Option<String>,
    data_hall: Option<String>,
    machine: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Version => {
            println!("helmsman {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read config file: {}", p.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        }
        None => Ok(Config::default()),
    }
}

fn parse_class(name: &str) -> Result<ClassType> {
    Ok(match name {
        "unset" => ClassType::Unset,
        "storage" => ClassType::Storage,
        "transaction" => ClassType::TLog,
        "proxy" => ClassType::Proxy,
        "resolution" => ClassType::Resolver,
        "master" => ClassType::Master,
        "stateless" => ClassType::Stateless,
        "router" => ClassType::LogRouter,
        "cluster_controller" => ClassType::ClusterController,
        "test" => ClassType::Tester,
        other => anyhow::bail!("unknown process class: {other}"),
    })
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if args.bind.is_some() {
        config.bind = args.bind;
    }
    if args.process_id.is_some() {
        config.process_id = args.process_id;
    }
    if args.dc.is_some() {
        config.locality.dc = args.dc;
    }
    if args.zone.is_some() {
        config.locality.zone = args.zone;
    }
    if args.data_hall.is_some() {
        config.locality.data_hall = args.data_hall;
    }
    if args.machine.is_some() {
        config.locality.machine = args.machine;
    }
    if args.class.is_some() {
        config.class = args.class;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if config.log_level.is_empty() {
            "info"
        } else {
            &config.log_level
        })
    });
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    let bind = config.bind.unwrap_or_else(|| "127.0.0.1:4500".parse().expect("valid default"));
    let process_id =
        config.process_id.clone().unwrap_or_else(|| format!("helmsman-{}", std::process::id()));
    let class_type = parse_class(config.class.as_deref().unwrap_or("unset"))?;

    let mut locality = Locality::new(process_id.as_str());
    if let Some(dc) = &config.locality.dc {
        locality = locality.with_dc(dc.as_str());
    }
    if let Some(zone) = &config.locality.zone {
        locality = locality.with_zone(zone);
    }
    if let Some(hall) = &config.locality.data_hall {
        locality = locality.with_data_hall(hall);
    }
    if let Some(machine) = &config.locality.machine {
        locality = locality.with_machine(machine);
    }

    let (handle, requests) = controller_channels();
    let controller: Arc<Controller> = Controller::new(
        bind,
        locality.clone(),
        Arc::new(config.knobs.clone()),
        MemoryStore::new(),
        Arc::new(NoOpLogMetricsSource),
    );

    info!(address = %bind, controller = %controller.id, "Starting cluster controller");

    let (leader_tx, leader_rx) = oneshot::channel();
    let core = tokio::spawn(run_cluster_controller(controller.clone(), requests, leader_rx));

    // Register our own process as a worker and serve its endpoints.
    let (interface, endpoints) = WorkerInterface::new(bind, locality);
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
        .ok();
    tokio::spawn(local_worker(interface, endpoints));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            let _ = leader_tx.send(());
        }
        result = core => {
            match result {
                Ok(Ok(())) => info!("Controller stopped"),
                Ok(Err(err)) => warn!(error = %err, "Controller stopped with error"),
                Err(err) => warn!(error = %err, "Controller task failed"),
            }
        }
    }

    Ok(())
}

/// Minimal in-process worker runtime: acknowledges master recruitment and
/// drains coordination pings.
async fn local_worker(interface: WorkerInterface, mut endpoints: WorkerEndpoints) {
    loop {
        tokio::select! {
            req = endpoints.master.recv() => {
                let Some(req) = req else { return };
                info!("Recruited as master");
                let _ = req.reply.send(MasterInterface {
                    id: uuid::Uuid::new_v4(),
                    address: interface.address,
                    locality: interface.locality.clone(),
                });
            }
            ping = endpoints.coordination_ping.recv() => {
                let Some(ping) = ping else { return };
                tracing::trace!(time_step = ping.time_step, "Coordination ping");
            }
        }
    }
}
