//! `mylm` -- a personal-assistant daemon: a console loop (or, in a real
//! deployment, a set of channel bridges) feeding a per-channel message
//! queue into a single [`Dispatcher`], with a background scheduler for
//! cron jobs and projection maintenance.

use anyhow::{Context, Result};
use clap::Parser;
use mylm_core::bridge::{BridgeRegistry, InMemoryBridge};
use mylm_core::crash_recovery::CrashRecovery;
use mylm_core::dispatcher::{Dispatcher, RestartRequest};
use mylm_core::queue::{Message, MessageQueue};
use mylm_core::reflection::ProjectionReflection;
use mylm_core::scheduler::{OperatorJob, ScheduleStore, SchedulerDaemon};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod supervisor;

const MERGE_WINDOW_MS: i64 = 2_000;
const IDLE_COMPACT_INTERVAL_SECS: u64 = 600;
const REFLECTION_INTERVAL_SECS: u64 = 1800;

/// Exit code the process uses for a cooperative restart; the supervisor
/// wrapper relaunches on seeing it instead of treating it as a crash.
pub const RESTART_EXIT_CODE: i32 = 42;

#[derive(Parser, Debug)]
#[command(name = "mylm", version, about = "Personal-assistant orchestration daemon")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// Directory for sessions, projections, logs, and other runtime state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run the cooperative-restart supervisor instead of the daemon itself.
    #[arg(long)]
    supervise: bool,
}

fn resolve_data_dir(cli_value: Option<PathBuf>) -> PathBuf {
    cli_value
        .or_else(|| std::env::var("MYLM_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir.clone());
    tokio::fs::create_dir_all(&data_dir).await.context("failed to create data directory")?;
    let _log_guard = init_tracing(&data_dir);

    if cli.supervise {
        return supervisor::run(&cli.config, cli.data_dir).await;
    }

    run_daemon(cli, data_dir).await
}

/// Stdout for interactive use plus a daily-rotated `logs/runtime.log` --
/// the operational log stream, distinct from the `history/*.jsonl`
/// conversational audit log and `logs/tool-calls.jsonl` tool-invocation log,
/// which are application-level records rather than this trace output.
fn init_tracing(data_dir: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "runtime.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive("mylm_core=info".parse().unwrap());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();

    guard
}

async fn run_daemon(cli: Cli, data_dir: PathBuf) -> Result<()> {
    let crash_recovery = Arc::new(CrashRecovery::new(&data_dir));
    let (config, rolled_back) = crash_recovery
        .load_with_rollback(&cli.config)
        .await
        .context("failed to load configuration")?;
    if rolled_back {
        warn!("config.yml failed to parse; rolled back to the pre-restart snapshot");
    }

    let bridges = Arc::new(BridgeRegistry::new());
    let console = Arc::new(InMemoryBridge::new());
    bridges.register(config.primary_user.platform.clone(), console.clone());

    crash_recovery.sweep_checkpoints(&bridges).await;
    let restart_greeting = crash_recovery.take_restart_marker().await;

    let (restart_tx, mut restart_rx) = tokio::sync::mpsc::unbounded_channel::<RestartRequest>();
    let dispatcher = Arc::new(Dispatcher::new(data_dir.clone(), &config, bridges.clone(), restart_tx));

    let queue = Arc::new(MessageQueue::new(dispatcher.clone(), dispatcher.clone(), MERGE_WINDOW_MS));
    dispatcher.attach_queue(queue.clone());

    let primary_runtime = dispatcher
        .primary_user_runtime()
        .await
        .context("failed to open the primary user's workspace")?;
    let operator_jobs: Vec<OperatorJob> = config
        .cron
        .iter()
        .map(|entry| OperatorJob { cron_expression: entry.expression.clone(), message: entry.message.clone() })
        .collect();
    let schedule_store = ScheduleStore::new(&data_dir);
    let scheduler = Arc::new(
        SchedulerDaemon::new(schedule_store, operator_jobs, config.primary_user.clone(), queue.clone(), primary_runtime.projections.clone())
            .await
            .context("failed to start scheduler")?,
    );
    dispatcher.attach_scheduler(scheduler.clone());
    tokio::spawn(scheduler.clone().run());

    if let Some(marker) = restart_greeting {
        let _ = bridges.send(&marker.platform, &marker.channel_id, "Back online.").await;
    }

    spawn_idle_passes(dispatcher.clone());
    spawn_reflection_pass(primary_runtime.projections.clone(), dispatcher.clone(), &config);

    info!(primary_user = %config.primary_user.user_id, "mylm daemon ready");
    println!("mylm ready. Type a message and press enter (ctrl-d to quit).");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        let message = Message::new_user(
                            config.primary_user.channel_id.clone(),
                            config.primary_user.user_id.clone(),
                            text,
                            config.primary_user.platform.clone(),
                        );
                        queue.enqueue(message);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading stdin");
                        break;
                    }
                }
            }
            Some(request) = restart_rx.recv() => {
                crash_recovery.snapshot_config(&cli.config).await.ok();
                info!(reason = %request.marker.reason, "restart requested, exiting with code {}", RESTART_EXIT_CODE);
                std::process::exit(RESTART_EXIT_CODE);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down on ctrl-c");
                break;
            }
        }
    }

    for (channel_id, text) in console.sent() {
        info!(channel_id, text, "unread console reply at shutdown");
    }
    Ok(())
}

fn spawn_idle_passes(dispatcher: Arc<Dispatcher>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(IDLE_COMPACT_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            dispatcher.sessions().idle_compact_pass().await;
        }
    });
}

fn spawn_reflection_pass(
    projections: Arc<mylm_core::projections::ProjectionStore>,
    dispatcher: Arc<Dispatcher>,
    config: &mylm_core::config::Config,
) {
    let audit = dispatcher.audit().clone();
    let user_id = config.primary_user.user_id.clone();
    let model = config.agent.reflection_model.clone().unwrap_or_else(|| config.agent.model.clone());
    tokio::spawn(async move {
        let reflection = ProjectionReflection::new(projections, audit, user_id, model);
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(REFLECTION_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if let Err(e) = reflection.run_if_due().await {
                warn!(error = %e, "reflection pass failed");
            }
        }
    });
}
