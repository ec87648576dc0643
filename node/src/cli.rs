//! # CLI Interface
//!
//! Defines the command-line argument structure for `escrow-node` using
//! `clap` derive. Supports three subcommands: `serve`, `sweep`, and
//! `version`. Every flag falls back to an `ESCROW_*` environment variable.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Escrow transaction and dispute resolution node.
///
/// Serves the escrow engine over HTTP, runs deadline sweeps, and exposes
/// Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "escrow-node",
    about = "Escrow transaction and dispute resolution node",
    version,
    propagate_version = true
)]
pub struct EscrowNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the escrow node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP API, the metrics endpoint and the periodic sweep.
    Serve(ServeArgs),
    /// Run a single deadline sweep against the data directory and exit.
    Sweep(SweepArgs),
    /// Print version information and exit.
    Version,
}

/// Options shared by every subcommand that opens the engine.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Directory holding the sled database.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "ESCROW_DATA_DIR", default_value = "./escrow-data")]
    pub data_dir: PathBuf,

    /// Keep all state in memory. Nothing is written to the data directory.
    #[arg(long, env = "ESCROW_IN_MEMORY", default_value_t = false)]
    pub in_memory: bool,

    /// Minimum payout in minor units.
    #[arg(long, env = "ESCROW_MIN_PAYOUT", default_value_t = escrow_engine::config::DEFAULT_MIN_PAYOUT)]
    pub min_payout: u64,

    /// Upper bound on any single payment gateway call, in milliseconds.
    #[arg(long, env = "ESCROW_GATEWAY_TIMEOUT_MS", default_value_t = 30_000)]
    pub gateway_timeout_ms: u64,

    /// Default log filter when `RUST_LOG` is not set.
    #[arg(long, env = "ESCROW_LOG_LEVEL", default_value = "escrow_node=info,escrow_engine=info,tower_http=debug")]
    pub log_level: String,

    /// Log output format: `pretty`, `compact` or `json`.
    #[arg(long, env = "ESCROW_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `serve` subcommand.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Port for the REST API.
    #[arg(long, env = "ESCROW_API_PORT", default_value_t = 8640)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "ESCROW_METRICS_PORT", default_value_t = 8641)]
    pub metrics_port: u16,

    /// Seconds between background deadline sweeps. `0` disables them.
    #[arg(long, env = "ESCROW_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Mediator ids handed out round-robin, comma separated.
    #[arg(long, env = "ESCROW_MEDIATORS", value_delimiter = ',', default_value = "mediator-1")]
    pub mediators: Vec<String>,
}

/// Arguments for the `sweep` subcommand.
#[derive(Parser, Debug)]
pub struct SweepArgs {
    #[command(flatten)]
    pub engine: EngineArgs,
}
