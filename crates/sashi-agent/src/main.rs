//! sagent - the sashimono instance lifecycle daemon.
//!
//! Owns the instance store and the `sa.sock` control socket. Refuses to
//! start unless the host passes the system-readiness preflight, since
//! instance resource limits depend on the cgroup rules engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sashi_agent::context::AgentContext;
use sashi_agent::manager::InstanceManager;
use sashi_agent::{preflight, server};
use sashi_core::config::AgentConfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// sashimono instance lifecycle daemon
#[derive(Parser, Debug)]
#[command(name = "sagent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Data directory holding config, databases, and the socket
    #[arg(long, default_value = "/etc/sashimono")]
    data_dir: PathBuf,

    /// Binary directory holding scripts and the bundled docker cli
    #[arg(long, default_value = "/usr/bin/sashimono")]
    bin_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Skip the system-readiness preflight (dev only)
    #[arg(long)]
    skip_preflight: bool,
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_tracing(&args) {
        eprintln!("logging setup failed: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = run(args).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    if args.skip_preflight {
        info!("skipping system-readiness preflight");
    } else if !preflight::system_ready().await {
        anyhow::bail!("system is not ready to run instances");
    }

    let ctx = AgentContext::new(args.data_dir, args.bin_dir);
    let config =
        AgentConfig::from_file(&ctx.config_path).context("failed to load agent config")?;

    let manager = InstanceManager::init(ctx.clone(), config)
        .map_err(|e| anyhow::anyhow!("instance manager init failed: {e}"))?;
    let listener = server::bind_socket(&ctx.socket_path).context("failed to bind daemon socket")?;

    info!(
        pid = std::process::id(),
        socket = %ctx.socket_path.display(),
        "sagent started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    server::run(listener, manager, shutdown_rx)
        .await
        .context("socket server failed")?;
    signal_task.abort();

    if let Err(e) = std::fs::remove_file(&ctx.socket_path) {
        tracing::warn!("failed to remove socket file: {e}");
    }
    info!("sagent shutdown complete");
    Ok(())
}
