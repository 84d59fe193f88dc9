//! sashi-board - the message-board reconciliation service.
//!
//! Connects to the ledger, replays missed history, then multiplexes the
//! ledger event stream with the scheduler tick, the heartbeat timer,
//! and the orphan-prune timer on a single task. Ledger disconnect or
//! desync exits nonzero so the supervisor restarts the service.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sashi_board::daemon_client::DaemonClient;
use sashi_board::heartbeat::{self, ScheduleInput};
use sashi_board::ledger::ws::WsLedgerClient;
use sashi_board::ledger::{event_channel, EventReceiver, LedgerClient, LedgerEvent};
use sashi_board::reconciler::{Reconciler, ReconcilerDeps};
use sashi_core::config::AgentConfig;
use sashi_core::store::{InstanceStore, LeaseStore};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// sashimono message-board reconciler
#[derive(Parser, Debug)]
#[command(name = "sashi-board")]
#[command(version, about, long_about = None)]
struct Args {
    /// Data directory shared with the lifecycle daemon
    #[arg(long, default_value = "/etc/sashimono")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
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

/// Low 16 bits of the registration token id, used for heartbeat
/// staggering.
fn token_low16(token_id: &str) -> u16 {
    let tail = &token_id[token_id.len().saturating_sub(4)..];
    u16::from_str_radix(tail, 16).unwrap_or(0)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_tracing(&args) {
        eprintln!("logging setup failed: {e:#}");
        std::process::exit(1);
    }

    match run(args).await {
        Ok(()) => info!("sashi-board shutdown complete"),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = args.data_dir.join("sa.cfg");
    let governance_path = args.data_dir.join("governance.cfg");
    let mb_dir = args.data_dir.join("mb-xahau");
    let socket_path = args.data_dir.join("sa.sock");

    let config = AgentConfig::from_file(&config_path).context("failed to load agent config")?;

    std::fs::create_dir_all(&mb_dir).context("failed to create message-board dir")?;
    let store = LeaseStore::new(mb_dir.join("mb-xahau.sqlite"));
    store
        .ensure_schema()
        .context("failed to prepare message-board database")?;
    let instance_store = InstanceStore::new(args.data_dir.join("sa.sqlite"));

    let (events_tx, events_rx) = event_channel();
    let client = Arc::new(WsLedgerClient::new(
        &config.xrpl.address,
        &config.xrpl.secret,
        &config.xrpl.governor_address,
        events_tx,
    ));

    let mut servers = Vec::new();
    if let Some(primary) = &config.xrpl.rippled_server {
        servers.push(primary.clone());
    }
    servers.extend(config.xrpl.fallback_rippled_servers.iter().cloned());
    client
        .connect(&servers)
        .await
        .context("ledger connection failed")?;

    let registration = client
        .host_registration()
        .await
        .context("host registration lookup failed")?;
    let hook = client.hook_config().await.context("hook config lookup failed")?;
    info!(
        token_id = %registration.token_id,
        moment_size = hook.moment_size,
        acquire_window = hook.lease_acquire_window,
        "connected to ledger"
    );

    let daemon = DaemonClient::new(&socket_path);
    let scheduler = config.scheduler.clone();
    let mut reconciler = Reconciler::new(ReconcilerDeps {
        config,
        config_path,
        governance_path: governance_path.clone(),
        client: Arc::clone(&client) as Arc<dyn LedgerClient>,
        daemon,
        store,
        instance_store,
        registration: registration.clone(),
        hook: hook.clone(),
    });

    // Startup sequence: account prep, catch-up, fixes, one prune, and
    // an opportunistic rebate request.
    reconciler.prepare_account();
    reconciler.catch_up().await;
    reconciler.fix_inconsistencies().await;
    reconciler.prune_orphans().await;
    reconciler.enqueue_reg_update();
    reconciler.schedule_rebate();
    reconciler.drain_queue().await;

    let heartbeat_delay = initial_heartbeat_delay(&*client, &registration.token_id).await;
    info!(delay_secs = heartbeat_delay.as_secs(), "first heartbeat scheduled");

    event_loop(
        &mut reconciler,
        events_rx,
        &*client,
        &governance_path,
        scheduler.tick,
        scheduler.prune_interval,
        heartbeat_delay,
    )
    .await
}

async fn initial_heartbeat_delay(client: &WsLedgerClient, token_id: &str) -> Duration {
    let now = chrono::Utc::now().timestamp().unsigned_abs();
    let (moment_start, current_moment, moment_size, last_heartbeat_moment) = match (
        client.moment_start_time().await,
        client.moment(None).await,
        client.hook_config().await,
        client.host_registration().await,
    ) {
        (Ok(start), Ok(moment), Ok(hook), Ok(reg)) => {
            (start, moment, hook.moment_size, reg.last_heartbeat_moment)
        }
        _ => {
            warn!("heartbeat inputs unavailable, sending in one minute");
            return Duration::from_secs(60);
        }
    };

    Duration::from_secs(heartbeat::next_heartbeat_delay(ScheduleInput {
        now,
        moment_start,
        moment_size,
        current_moment,
        last_heartbeat_moment,
        token_low16: token_low16(token_id),
    }))
}

async fn event_loop(
    reconciler: &mut Reconciler,
    mut events: EventReceiver,
    client: &WsLedgerClient,
    governance_path: &std::path::Path,
    tick: Duration,
    prune_interval: Duration,
    first_heartbeat: Duration,
) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;

    let mut tick_timer = tokio::time::interval(tick);
    tick_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut prune_timer = tokio::time::interval(prune_interval);
    prune_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    prune_timer.reset(); // startup already pruned
    let mut heartbeat_at = tokio::time::Instant::now() + first_heartbeat;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("ledger event channel closed");
                };
                match event {
                    LedgerEvent::Acquire(acquire) => {
                        let ledger_index = acquire.ledger_index;
                        reconciler.handle_acquire(acquire).await;
                        reconciler.advance_checkpoint(ledger_index);
                    }
                    LedgerEvent::Extend(extend) => {
                        let ledger_index = extend.ledger_index;
                        reconciler.handle_extend(extend).await;
                        reconciler.advance_checkpoint(ledger_index);
                    }
                    LedgerEvent::Terminate(terminate) => {
                        reconciler.handle_terminate(terminate).await;
                    }
                    LedgerEvent::HostRegistered => {
                        info!("host registration confirmed");
                        reconciler.schedule_rebate();
                    }
                    LedgerEvent::Tick { ledger_time, .. } => {
                        reconciler.halt_mut().on_tick(ledger_time);
                    }
                    LedgerEvent::Disconnected => {
                        anyhow::bail!("ledger disconnected");
                    }
                    LedgerEvent::Desynced => {
                        anyhow::bail!("ledger desynced");
                    }
                }
            }
            _ = tick_timer.tick() => {
                reconciler.tick().await;
            }
            _ = tokio::time::sleep_until(heartbeat_at) => {
                send_heartbeats(reconciler, client, governance_path).await;
                // Subsequent sends follow the moment cadence.
                let delay = moment_cadence_delay(client).await;
                heartbeat_at = tokio::time::Instant::now() + delay;
            }
            _ = prune_timer.tick() => {
                reconciler.prune_orphans().await;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return Ok(());
            }
        }
    }
}

/// Delay until the next moment boundary.
async fn moment_cadence_delay(client: &WsLedgerClient) -> Duration {
    let now = chrono::Utc::now().timestamp().unsigned_abs();
    match (client.moment_start_time().await, client.hook_config().await) {
        (Ok(start), Ok(hook)) => {
            Duration::from_secs((start + hook.moment_size).saturating_sub(now).max(1))
        }
        _ => {
            warn!("moment lookup failed, retrying heartbeat in one minute");
            Duration::from_secs(60)
        }
    }
}

async fn send_heartbeats(
    reconciler: &mut Reconciler,
    client: &WsLedgerClient,
    governance_path: &std::path::Path,
) {
    let candidates = match client.governance_candidates().await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("candidate fetch failed, heartbeating without votes: {e}");
            Vec::new()
        }
    };
    for payload in heartbeat::plan_from_file(governance_path, candidates) {
        reconciler.enqueue_heartbeat(payload);
    }
}
