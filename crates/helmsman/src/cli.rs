//! Command-line interface definitions.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Helmsman: cluster controller for a replicated, sharded transactional
/// database.
#[derive(Debug, Parser)]
#[command(name = "helmsman", version, about)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a controller process.
    Serve(ServeArgs),
    /// Print the version and exit.
    Version,
}

/// Arguments for `helmsman serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to announce; overrides the config file.
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Stable process identifier; overrides the config file.
    #[arg(long)]
    pub process_id: Option<String>,

    /// Datacenter of this process.
    #[arg(long)]
    pub dc: Option<String>,

    /// Failure zone of this process.
    #[arg(long)]
    pub zone: Option<String>,

    /// Data hall of this process.
    #[arg(long)]
    pub data_hall: Option<String>,

    /// Machine of this process.
    #[arg(long)]
    pub machine: Option<String>,

    /// Declared process class (unset, storage, transaction, stateless,
    /// proxy, resolution, master, router, cluster_controller, test).
    #[arg(long)]
    pub class: Option<String>,
}
