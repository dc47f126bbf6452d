//! beads-bridged binary.
//!
//! Wires together the registry, scheduler, session service and change
//! watcher (`beads-core`) behind an axum WebSocket transport.

mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use beads_cli::adapter::ProcessCliRunner;
use beads_cli::config::TrackerConfig;
use beads_core::{ChangeWatcher, RegistryService, SchedulerHandle, SessionService};
use clap::Parser;
use tracing::info;

/// beads-bridged command line arguments.
#[derive(Parser, Debug)]
#[command(name = "beads-bridged")]
#[command(about = "Subscription bridge daemon in front of the bd tracker CLI")]
struct Args {
    /// Address to bind the WebSocket listener on.
    #[arg(short, long, value_name = "ADDR")]
    addr: Option<String>,

    /// Path to the bd append log to watch for external changes.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Schedule an immediate best-effort refresh right after a mutation, in
    /// addition to the debounced watcher-driven path.
    #[arg(long)]
    immediate_refresh: bool,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if args.verbose {
                    tracing_subscriber::EnvFilter::new("debug")
                } else {
                    tracing_subscriber::EnvFilter::new("info")
                }
            }),
        )
        .init();

    info!("starting beads-bridged");

    let config = TrackerConfig::from_env();
    let runner: Arc<dyn beads_cli::adapter::CliRunner> =
        Arc::new(ProcessCliRunner::new(config.binary.clone()));

    let (sessions, registry_tx) = SessionService::start();
    let registry = RegistryService::start(sessions.clone());
    let _ = registry_tx.send(registry.clone()).await;

    let scheduler = SchedulerHandle::new(runner.clone(), config.clone(), registry.clone());

    let log_file = args.log_file.unwrap_or_else(|| default_log_file(&config));
    let watcher = ChangeWatcher::spawn(log_file.clone(), scheduler.clone());
    info!(path = %log_file.display(), active = watcher.is_active(), "change watcher");

    let addr = args.addr.unwrap_or_else(beads_proto::paths::default_bind_addr);
    info!(%addr, "binding WebSocket listener");

    let state = ws::AppState {
        sessions,
        registry,
        scheduler,
        cli: runner,
        config,
        immediate_refresh_on_mutation: args.immediate_refresh,
    };

    let app = ws::router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Resolution order: `BEADS_LOG_FILE` env var, else a `beads.log` sibling of
/// the configured database path, else `.beads/beads.log` under the current
/// directory. Mirrors `TrackerConfig::from_env`'s own fallback shape.
fn default_log_file(config: &TrackerConfig) -> PathBuf {
    if let Ok(p) = std::env::var("BEADS_LOG_FILE") {
        return PathBuf::from(p);
    }
    if let Some(db_path) = &config.db_path {
        let db_path = PathBuf::from(db_path);
        if let Some(parent) = db_path.parent() {
            return parent.join("beads.log");
        }
    }
    PathBuf::from(".beads").join("beads.log")
}
