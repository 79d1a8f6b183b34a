use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Controller(ControllerArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Path to the local kubeconfig; in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Requeue limit for failing reconciliation events
    #[arg(long, default_value_t = 3)]
    pub event_requeue_limit: u32,

    /// Metrics listener
    #[arg(long, default_value = "0.0.0.0:9999")]
    pub metrics_address: SocketAddr,

    /// Seconds between orphaned mirror sweeps
    #[arg(long, default_value_t = 60)]
    pub gc_period_seconds: u64,

    /// Consecutive probe failures before a gateway is marked down
    #[arg(long, default_value_t = 3)]
    pub probe_failure_threshold: u32,
}
