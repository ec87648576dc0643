// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Escrow Node
//!
//! Entry point for the `escrow-node` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the store, and serves the engine
//! over HTTP.
//!
//! The binary supports three subcommands:
//!
//! - `serve`: HTTP API, metrics endpoint and periodic deadline sweeps
//! - `sweep`: one deadline sweep, report printed as JSON
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use escrow_engine::gateway::sandbox::{LogNotifier, RoundRobinMediators, SandboxGateway};
use escrow_engine::storage::{EscrowStore, MemoryStore, SledStore};
use escrow_engine::{EngineConfig, EscrowEngine};

use cli::{Commands, EngineArgs, EscrowNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = EscrowNodeCli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Sweep(args) => sweep_once(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// An engine plus the sled handle to flush on exit, if any.
struct OpenedEngine {
    engine: EscrowEngine,
    sled: Option<SledStore>,
}

impl OpenedEngine {
    fn flush(&self) {
        if let Some(sled) = &self.sled {
            if let Err(e) = sled.flush() {
                tracing::error!("failed to flush database: {}", e);
            }
        }
    }
}

/// Opens the store and wires the engine to the sandbox collaborators.
fn open_engine(args: &EngineArgs, mediators: Vec<String>) -> Result<OpenedEngine> {
    let (store, sled): (Arc<dyn EscrowStore>, Option<SledStore>) = if args.in_memory {
        tracing::warn!("running with an in-memory store; state is lost on exit");
        (Arc::new(MemoryStore::new()), None)
    } else {
        let db_path = args.data_dir.join("db");
        std::fs::create_dir_all(&db_path).with_context(|| {
            format!("failed to create database directory: {}", db_path.display())
        })?;
        let sled = SledStore::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        tracing::info!(
            path = %db_path.display(),
            transactions = sled.transaction_count(),
            "database opened"
        );
        (Arc::new(sled.clone()), Some(sled))
    };

    let config = EngineConfig::default()
        .with_min_payout(args.min_payout)
        .with_gateway_timeout(Duration::from_millis(args.gateway_timeout_ms));

    let engine = EscrowEngine::new(
        store,
        Arc::new(SandboxGateway::new()),
        Arc::new(RoundRobinMediators::new(mediators)),
        Arc::new(LogNotifier),
        config,
    );
    Ok(OpenedEngine { engine, sled })
}

/// Starts the API server, the metrics endpoint, and the sweep loop.
async fn serve(args: cli::ServeArgs) -> Result<()> {
    logging::init_logging(
        &args.engine.log_level,
        LogFormat::from_str_lossy(&args.engine.log_format),
    )
    .context("failed to install log subscriber")?;

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.engine.data_dir.display(),
        in_memory = args.engine.in_memory,
        "starting escrow-node"
    );

    let opened = open_engine(&args.engine, args.mediators.clone())?;
    let sled = opened.sled.clone();
    let engine = Arc::new(opened.engine);

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Application state ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine: Arc::clone(&engine),
        metrics: Arc::clone(&node_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Deadline sweeps ---
    let sweep_loop = (args.sweep_interval_secs > 0).then(|| {
        let engine = Arc::clone(&engine);
        let metrics = Arc::clone(&node_metrics);
        let period = Duration::from_secs(args.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match engine.sweep(chrono::Utc::now()).await {
                    Ok(report) => {
                        for _ in 0..report.actions() {
                            metrics.record_transition("sweep");
                        }
                        if report.actions() > 0 || !report.failures.is_empty() {
                            tracing::info!(
                                actions = report.actions(),
                                failures = report.failures.len(),
                                "sweep completed"
                            );
                        }
                    }
                    Err(e) => tracing::error!("sweep failed: {}", e),
                }
            }
        })
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    if let Some(handle) = sweep_loop {
        handle.abort();
    }
    if let Some(sled) = sled {
        sled.flush().context("failed to flush database")?;
    }
    tracing::info!("escrow-node stopped");
    Ok(())
}

/// Runs one sweep and prints the report to stdout.
async fn sweep_once(args: cli::SweepArgs) -> Result<()> {
    logging::init_logging(
        &args.engine.log_level,
        LogFormat::from_str_lossy(&args.engine.log_format),
    )
    .context("failed to install log subscriber")?;

    let opened = open_engine(&args.engine, Vec::new())?;
    let report = opened
        .engine
        .sweep(chrono::Utc::now())
        .await
        .context("sweep failed")?;
    opened.flush();

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to encode sweep report")?
    );
    Ok(())
}

/// Prints the build version and the business constants compiled in.
fn print_version() {
    use escrow_engine::config;

    println!("escrow-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc       {}", option_env!("RUSTC_VERSION").unwrap_or("unknown"));
    println!(
        "fees        {} bps base, clamped to [{}, {}] minor units",
        config::BASE_FEE_BPS,
        config::MIN_FEE,
        config::MAX_FEE
    );
    println!(
        "windows     payment {}h, delivery {}d, auto-release {}d, disputes {}d",
        config::PAYMENT_WINDOW_HOURS,
        config::DELIVERY_WINDOW_DAYS,
        config::AUTO_RELEASE_WINDOW_DAYS,
        config::DISPUTE_RESOLUTION_DAYS
    );
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
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
