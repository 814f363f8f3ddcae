//! # CLI Interface
//!
//! `clap` derive definitions for `deedchain-node`: `run`, `validate`,
//! `backups`, `salvage` and `version`. Every subcommand that touches data
//! shares [`CommonArgs`] so the same flags point at the same directory.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Property ledger node with redundant snapshot backup.
#[derive(Parser, Debug)]
#[command(
    name = "deedchain-node",
    about = "deedchain property ledger node",
    version,
    propagate_version = true
)]
pub struct DeedchainCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "DEEDCHAIN_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Restore the ledger, serve the HTTP API, back up on shutdown.
    Run(RunArgs),
    /// Decode the local snapshot and report every integrity violation.
    Validate(CommonArgs),
    /// List the relational backup records, newest first.
    Backups(CommonArgs),
    /// Keep the longest valid prefix of a damaged local snapshot and write
    /// it next to the live file.
    Salvage(CommonArgs),
    /// Print version information and exit.
    Version,
}

/// Flags shared by every data-touching subcommand.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Path to a TOML configuration file.
    #[arg(long, short = 'c', env = "DEEDCHAIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding the local snapshot, pointer file and backup
    /// database. Overrides the config file.
    #[arg(long, short = 'd', env = "DEEDCHAIN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Address for the HTTP API. Overrides the config file.
    #[arg(long, env = "DEEDCHAIN_API_ADDR")]
    pub api_addr: Option<String>,

    /// Address for the Prometheus endpoint. Overrides the config file.
    #[arg(long, env = "DEEDCHAIN_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Proof-of-work difficulty for a new ledger. Overrides the config file.
    #[arg(long, env = "DEEDCHAIN_DIFFICULTY")]
    pub difficulty: Option<u32>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
