//! # CLI Interface
//!
//! Command-line arguments for `meridian-node`, defined with `clap` derive.
//! Subcommands: `run`, `init`, `status` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Meridian vault node.
///
/// Hosts one vault instance: serves the HTTP/WebSocket API, exposes
/// Prometheus metrics and runs the periodic harvest and rebalance ticks.
#[derive(Parser, Debug)]
#[command(
    name = "meridian-node",
    about = "Meridian vault node",
    version,
    propagate_version = true
)]
pub struct MeridianNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and write a default `config.json`.
    Init(InitArgs),
    /// Query the status of a running node via its API.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (JSON).
    ///
    /// When omitted, the node looks for `config.json` in the data directory
    /// and falls back to built-in defaults.
    #[arg(long, short = 'c', env = "MERIDIAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the vault store.
    #[arg(long, short = 'd', env = "MERIDIAN_DATA_DIR", default_value = "./meridian-data")]
    pub data_dir: PathBuf,

    /// Port for the REST and WebSocket API.
    #[arg(long, env = "MERIDIAN_API_PORT", default_value_t = 8640)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "MERIDIAN_METRICS_PORT", default_value_t = 8641)]
    pub metrics_port: u16,

    /// Log output format.
    #[arg(long, env = "MERIDIAN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Seconds between harvest ticks. Each tick also settles management fees.
    #[arg(long, env = "MERIDIAN_HARVEST_INTERVAL", default_value_t = 900)]
    pub harvest_interval_secs: u64,

    /// Seconds between rebalance attempts. The vault's own cooldown still applies.
    #[arg(long, env = "MERIDIAN_REBALANCE_INTERVAL", default_value_t = 3_600)]
    pub rebalance_interval_secs: u64,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "MERIDIAN_DATA_DIR", default_value = "./meridian-data")]
    pub data_dir: PathBuf,

    /// Overwrite an existing `config.json`.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// API endpoint of the running node.
    #[arg(long, default_value = "http://127.0.0.1:8640")]
    pub api_url: String,
}
