//! Otto host binary: wires the store, scheduler kernel, runtime executor,
//! and delivery loop together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use otto_core::config::OttoConfig;
use otto_core::traits::MessageTransport;
use otto_core::types::now_ms;
use otto_scheduler::{
    ensure_heartbeat_task, ensure_watchdog_task, DeliveryProcessor, Heartbeat, OutboundQueue,
    RuntimeExecutor, SchedulerKernel, Watchdog,
};
use otto_store::SqliteStore;
use otto_telegram::{LogTransport, TelegramTransport};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Outbound drain cadence; independent of the scheduler tick.
const DRAIN_INTERVAL_MS: u64 = 5_000;

#[derive(Parser)]
#[command(name = "otto", version, about = "Personal automation runtime")]
struct Cli {
    /// Path to config.toml (default: ~/.otto/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and delivery loops until ctrl-c
    Serve {
        /// Override the database path from config
        #[arg(long)]
        db: Option<String>,
    },
    /// List all tasks
    Tasks,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "otto=debug,otto_scheduler=debug,otto_store=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<OttoConfig> {
    match path {
        Some(p) => OttoConfig::load_from(p).context("loading config"),
        None => OttoConfig::load().context("loading config"),
    }
}

fn open_store(config: &OttoConfig, db_override: Option<&str>) -> anyhow::Result<Arc<SqliteStore>> {
    let raw = db_override.unwrap_or(&config.db_path);
    let path = PathBuf::from(shellexpand::tilde(raw).into_owned());
    let store = SqliteStore::open(&path)
        .with_context(|| format!("opening database at {}", path.display()))?;
    info!("📦 Database: {}", path.display());
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve { db } => serve(config, db.as_deref()).await,
        Command::Tasks => list_tasks(config),
    }
}

async fn serve(config: OttoConfig, db_override: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(&config, db_override)?;

    // The self-monitoring jobs ride the same scheduler as user tasks
    let now = now_ms();
    ensure_watchdog_task(store.as_ref(), &config.watchdog, now)?;
    ensure_heartbeat_task(store.as_ref(), &config.notify, now)?;

    let transport: Arc<dyn MessageTransport> = match &config.telegram {
        Some(tg) if tg.enabled && !tg.bot_token.is_empty() => {
            info!("✈️ Telegram transport enabled");
            Arc::new(TelegramTransport::new(tg.bot_token.clone()))
        }
        _ => {
            warn!("Telegram not configured, logging outbound messages instead");
            Arc::new(LogTransport)
        }
    };

    let queue = OutboundQueue::new(store.clone(), config.queue.clone());
    let executor = Arc::new(RuntimeExecutor::new(
        store.clone(),
        Watchdog::new(store.clone(), queue.clone(), config.watchdog.clone(), &config.notify),
        Heartbeat::new(store.clone(), queue, &config.notify),
    ));

    let kernel = Arc::new(SchedulerKernel::new(
        store.clone(),
        Some(executor),
        config.scheduler.clone(),
    ));
    let mut kernel_handle = kernel.start();

    let processor = Arc::new(DeliveryProcessor::new(
        store.clone(),
        transport,
        config.queue.clone(),
    ));
    let drain_task = tokio::spawn({
        let processor = Arc::clone(&processor);
        async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(DRAIN_INTERVAL_MS));
            loop {
                interval.tick().await;
                if let Err(e) = processor.drain_due_messages(now_ms()).await {
                    tracing::error!("Outbound drain failed: {e}");
                }
            }
        }
    });

    info!("🤖 Otto is running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    kernel_handle.stop();
    drain_task.abort();
    Ok(())
}

fn list_tasks(config: OttoConfig) -> anyhow::Result<()> {
    let store = open_store(&config, None)?;
    let tasks = otto_core::traits::JobStore::list_tasks(store.as_ref())?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    for task in tasks {
        let state = match task.terminal_state {
            Some(t) => t.as_str(),
            None => task.status.as_str(),
        };
        let schedule = match (task.schedule, task.cadence_minutes) {
            (otto_core::types::ScheduleType::Recurring, Some(c)) => format!("every {c}min"),
            _ => format!("once at {:?}", task.run_at),
        };
        println!(
            "{:<40} {:<20} {:<10} {:<16} next: {:?}",
            task.id, task.job_type, state, schedule, task.next_run_at
        );
    }
    Ok(())
}
