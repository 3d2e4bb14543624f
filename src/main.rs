//! vibe-guard - vibration anomaly detection service
//!
//! # Usage
//!
//! ```bash
//! # Featurize the raw cases of one RPM, then train its model
//! vibe-guard prepare --rpm 800 --raw-dir ./data/raw/800
//! vibe-guard train --rpm 800
//!
//! # Rank cases by reconstruction error
//! vibe-guard score --rpm 800
//!
//! # Serve the HTTP API
//! vibe-guard serve --addr 0.0.0.0:8000
//! ```
//!
//! # Environment Variables
//!
//! - `VIBE_GUARD_CONFIG`: Path to the TOML config (default: ./vibe_guard.toml)
//! - `VIBE_GUARD_SERVER_ADDR`: Server bind address
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vibe_guard::api::create_app;
use vibe_guard::config::{self, GuardConfig};
use vibe_guard::model::ArtifactStore;
use vibe_guard::offline;
use vibe_guard::service::GuardService;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "vibe-guard")]
#[command(about = "Vibration anomaly detection with per-RPM autoencoders")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file (overrides VIBE_GUARD_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the HTTP API
    Serve {
        /// Override the server address (default: "127.0.0.1:8000")
        #[arg(short, long, env = "VIBE_GUARD_SERVER_ADDR")]
        addr: Option<String>,
    },

    /// Featurize raw case CSVs and fit normalization statistics
    Prepare {
        #[arg(long)]
        rpm: String,
        /// Directory holding Case*/ subdirectories of CSV files
        #[arg(long)]
        raw_dir: PathBuf,
    },

    /// Train the model of one RPM from its prepared dataset
    Train {
        #[arg(long)]
        rpm: String,
    },

    /// Score every prepared case against the active model
    Score {
        #[arg(long)]
        rpm: String,
        /// Output CSV (default: {model_dir}/model_{rpm}/scores_by_case.csv)
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

// ============================================================================
// Startup helpers
// ============================================================================

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<GuardConfig> {
    let config = match path {
        Some(p) => GuardConfig::load_from_file(p)
            .with_context(|| format!("Failed to load config from {}", p.display()))?,
        None => GuardConfig::load(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Cancelled on Ctrl+C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown.cancel();
    });
    token
}

// ============================================================================
// Subcommands
// ============================================================================

async fn run_server(addr: String, cancel_token: CancellationToken) -> Result<()> {
    let config = config::get().clone();

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  vibe-guard - Vibration Anomaly Detection");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        rpms = ?config.rpm.operating_points,
        model_dir = %config.storage.model_dir.display(),
        db = %config.storage.db_path.display(),
        "Starting service"
    );

    let service = GuardService::open(config).context("Failed to open service state")?;
    let app = create_app(service);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel_token.cancelled().await;
            info!("[HttpServer] Received shutdown signal");
        })
        .await
        .context("HTTP server error")?;

    info!("[HttpServer] Graceful shutdown complete");
    Ok(())
}

async fn run_prepare(rpm: String, raw_dir: PathBuf) -> Result<()> {
    let summary = tokio::task::spawn_blocking(move || {
        let config = config::get();
        let artifacts = ArtifactStore::from_config(&config.storage);
        offline::prepare(&raw_dir, &rpm, config, &artifacts)
    })
    .await
    .context("Preparation task panicked")??;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_train(rpm: String, cancel_token: CancellationToken) -> Result<()> {
    let summary = tokio::task::spawn_blocking(move || {
        let config = config::get();
        let artifacts = ArtifactStore::from_config(&config.storage);
        offline::train(&rpm, config, &artifacts, &cancel_token)
    })
    .await
    .context("Training task panicked")??;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_score(rpm: String, out: Option<PathBuf>) -> Result<()> {
    let scores = tokio::task::spawn_blocking(move || -> Result<_> {
        let config = config::get();
        let artifacts = ArtifactStore::from_config(&config.storage);
        let dataset = offline::load_dataset(&artifacts, &rpm)?;
        let bundle = artifacts
            .load_bundle(&rpm)
            .with_context(|| format!("No trained model for RPM {}", rpm))?;

        let scores = offline::score_cases(&dataset, bundle.network(), bundle.threshold_value())?;
        let out = out.unwrap_or_else(|| artifacts.model_path(&rpm).join("scores_by_case.csv"));
        offline::write_case_scores_csv(&out, &scores)?;
        info!(path = %out.display(), "Case scores written");
        Ok(scores)
    })
    .await
    .context("Scoring task panicked")??;

    for s in &scores {
        println!(
            "{:<8} windows={:<6} p95={:.6} anomaly={}",
            s.case_name, s.verdict.windows, s.verdict.err_p95, s.verdict.is_anomaly
        );
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.json_logs);

    let guard_config = load_config(args.config.as_deref())?;
    let default_addr = guard_config.server.addr.clone();
    config::init(guard_config);

    match args.command {
        SubCommand::Serve { addr } => {
            let addr = addr.unwrap_or(default_addr);
            run_server(addr, shutdown_token()).await?;
        }
        SubCommand::Prepare { rpm, raw_dir } => run_prepare(rpm, raw_dir).await?,
        SubCommand::Train { rpm } => run_train(rpm, shutdown_token()).await?,
        SubCommand::Score { rpm, out } => run_score(rpm, out).await?,
        SubCommand::Config => print!("{}", config::get().to_toml()?),
    }

    Ok(())
}
