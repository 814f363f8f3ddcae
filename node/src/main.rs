// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # deedchain Node
//!
//! Entry point for the `deedchain-node` binary.
//!
//! - `run`      restore the ledger, serve the HTTP API, final backup on exit
//! - `validate` integrity report for the local snapshot
//! - `backups`  list relational backup records
//! - `salvage`  keep the valid prefix of a damaged local snapshot
//! - `version`  build information

mod api;
mod cli;
mod logging;
mod metrics;
mod settings;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use deedchain::chain::validation::validate_blocks;
use deedchain::config::{SALVAGED_SNAPSHOT_FILE, SNAPSHOT_FORMAT_VERSION};
use deedchain::orchestrator::TierStatus;
use deedchain::tiers::{BackupSummary, LocalStore, RelationalBackupStore};
use deedchain::{Diagnostic, HashChain};

use cli::{CommonArgs, Commands, DeedchainCli};
use metrics::{MetricsState, NodeMetrics};
use settings::NodeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DeedchainCli::parse();
    logging::init_logging(logging::DEFAULT_FILTER, cli.log_format.into());

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Validate(common) => validate_snapshot(&load_config(&common)?),
        Commands::Backups(common) => list_backups(&load_config(&common)?),
        Commands::Salvage(common) => salvage_snapshot(&load_config(&common)?),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// File, then environment, then flags.
fn load_config(common: &CommonArgs) -> Result<NodeConfig> {
    let mut config = NodeConfig::load(common.config.as_deref())?;
    config.apply_env();
    if let Some(dir) = &common.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn run_node(args: cli::RunArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }
    if let Some(addr) = args.metrics_addr {
        config.metrics_addr = addr;
    }
    if let Some(difficulty) = args.difficulty {
        config.ledger.difficulty = difficulty;
    }

    tracing::info!(
        data_dir = %config.data_dir.display(),
        api_addr = %config.api_addr,
        metrics_addr = %config.metrics_addr,
        difficulty = config.ledger.difficulty,
        "starting deedchain-node"
    );
    tracing::debug!(?config, "effective configuration");

    let orchestrator = config.orchestrator()?;
    let outcome = orchestrator.restore().await.context("ledger restore failed")?;

    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);
    node_metrics.record_restore(&outcome.source, outcome.blocks);

    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        orchestrator: orchestrator.clone(),
        metrics: Arc::clone(&node_metrics),
    };

    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(&config.api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", config.api_addr))?;
    tracing::info!("API server listening on {}", config.api_addr);

    let metrics_router = metrics::metrics_router(MetricsState {
        metrics: Arc::clone(&node_metrics),
        orchestrator: orchestrator.clone(),
    });
    let metrics_listener = tokio::net::TcpListener::bind(&config.metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", config.metrics_addr))?;
    tracing::info!("metrics server listening on {}", config.metrics_addr);

    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let report = orchestrator.shutdown().await.context("final backup failed")?;
    for outcome in &report.tiers {
        match &outcome.status {
            TierStatus::Stored { handle } => {
                tracing::info!(tier = %outcome.tier, %handle, "final snapshot stored")
            }
            TierStatus::Failed { error } => {
                tracing::warn!(tier = %outcome.tier, %error, "final snapshot not stored")
            }
            TierStatus::TimedOut => {
                tracing::warn!(tier = %outcome.tier, "final snapshot timed out")
            }
            TierStatus::Superseded { newest } => {
                tracing::info!(tier = %outcome.tier, newest, "tier already holds a newer snapshot")
            }
        }
    }
    tracing::info!(
        abandoned = report.abandoned_replications,
        pointer_sinks = report.pointer.len(),
        "deedchain-node stopped"
    );
    Ok(())
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Maintenance Commands
// ---------------------------------------------------------------------------

/// Integrity report for the local snapshot.
#[derive(Debug)]
struct ValidationReport {
    path: PathBuf,
    blocks: usize,
    difficulty: u32,
    diagnostics: Vec<Diagnostic>,
}

fn inspect_local(config: &NodeConfig) -> Result<ValidationReport> {
    let local = config.local_store();
    let bytes = local
        .read()
        .with_context(|| format!("failed to read {}", local.path().display()))?
        .with_context(|| format!("no snapshot at {}", local.path().display()))?;
    let document = config
        .codec()?
        .decode_unverified(&bytes)
        .context("snapshot could not be opened")?;
    Ok(ValidationReport {
        path: local.path().to_path_buf(),
        blocks: document.blocks.len(),
        difficulty: document.difficulty,
        diagnostics: validate_blocks(&document.blocks, document.difficulty),
    })
}

fn validate_snapshot(config: &NodeConfig) -> Result<()> {
    let report = inspect_local(config)?;
    println!("Snapshot   : {}", report.path.display());
    println!("Blocks     : {}", report.blocks);
    println!("Difficulty : {}", report.difficulty);
    if report.diagnostics.is_empty() {
        println!("Result     : valid");
        return Ok(());
    }
    println!("Result     : {} violation(s)", report.diagnostics.len());
    for diagnostic in &report.diagnostics {
        println!("  {diagnostic}");
    }
    bail!("snapshot failed validation")
}

fn backup_summaries(config: &NodeConfig) -> Result<Vec<BackupSummary>> {
    let path = config.relational_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let store = RelationalBackupStore::open(&path, config.relational.retention)
        .with_context(|| format!("failed to open backup database {}", path.display()))?;
    Ok(store.list()?)
}

fn list_backups(config: &NodeConfig) -> Result<()> {
    let backups = backup_summaries(config)?;
    if backups.is_empty() {
        println!("No backup records.");
        return Ok(());
    }
    println!("{:>6}  {:<32}  {:<25}  {:>10}", "ID", "NAME", "CREATED", "BYTES");
    for b in backups {
        println!(
            "{:>6}  {:<32}  {:<25}  {:>10}",
            b.id,
            b.name,
            b.created_at.to_rfc3339(),
            b.size
        );
    }
    Ok(())
}

#[derive(Debug)]
struct SalvageSummary {
    kept: usize,
    dropped: usize,
    output: PathBuf,
}

/// Keep the longest valid prefix and seal it next to the live snapshot.
/// The live file is never touched.
fn salvage(config: &NodeConfig) -> Result<SalvageSummary> {
    let codec = config.codec()?;
    let local = config.local_store();
    let bytes = local
        .read()
        .with_context(|| format!("failed to read {}", local.path().display()))?
        .with_context(|| format!("no snapshot at {}", local.path().display()))?;
    let document = codec
        .decode_unverified(&bytes)
        .context("snapshot could not be opened; salvage needs a decryptable file")?;
    if document.format_version != SNAPSHOT_FORMAT_VERSION {
        bail!("unsupported snapshot format {}", document.format_version);
    }

    let total = document.blocks.len();
    let (chain, diagnostics) = HashChain::salvage_prefix(document.blocks, document.difficulty);
    if chain.is_empty() {
        bail!("no valid prefix to salvage ({} violation(s))", diagnostics.len());
    }

    let output = LocalStore::at(config.data_dir.join(SALVAGED_SNAPSHOT_FILE));
    output
        .write(&codec.encode(&chain)?)
        .with_context(|| format!("failed to write {}", output.path().display()))?;
    tracing::info!(kept = chain.len(), dropped = total - chain.len(), "snapshot salvaged");

    Ok(SalvageSummary {
        kept: chain.len(),
        dropped: total - chain.len(),
        output: output.path().to_path_buf(),
    })
}

fn salvage_snapshot(config: &NodeConfig) -> Result<()> {
    let summary = salvage(config)?;
    println!("Kept    : {} block(s)", summary.kept);
    println!("Dropped : {} block(s)", summary.dropped);
    println!("Written : {}", summary.output.display());
    println!("Review it, then move it over the live snapshot to adopt it.");
    Ok(())
}

fn print_version() {
    println!("deedchain-node {}", env!("CARGO_PKG_VERSION"));
    println!("snapshot format {}", SNAPSHOT_FORMAT_VERSION);
}
