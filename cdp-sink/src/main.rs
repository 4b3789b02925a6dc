//! cdp-sink - Data sink worker
//!
//! Consumes integration results from the in-process queue, sweeps DELAYED
//! results back for another attempt and, when enabled, schedules periodic
//! member enrichment. Operator commands replay failed results, repair the
//! organization cache and erase members.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cdp_common::events::EventBus;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use cdp_sink::config::SinkConfig;
use cdp_sink::enrichment::{Arbiter, EnrichmentScheduler, HttpArbitrationClient};
use cdp_sink::ingest::{self, QueueMessage, QueueWorker};
use cdp_sink::organizations::repair_organization_cache;
use cdp_sink::sync::EventBusSync;
use cdp_sink::AppState;

const REPLAY_BATCH: i64 = 1000;
const CACHE_REPAIR_BATCH: i64 = 100;

#[derive(Parser, Debug)]
#[command(name = "cdp-sink")]
#[command(about = "Data sink and member enrichment worker")]
#[command(version)]
struct Args {
    /// Root folder holding the database
    #[arg(short, long, env = "CDP_ROOT_FOLDER")]
    root_folder: Option<String>,

    /// TOML configuration file
    #[arg(short, long, env = "CDP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the queue worker, delayed sweeper and enrichment scheduler
    Run,
    /// Reset ERROR results to PENDING and process them again
    Replay {
        /// Single result to replay
        result_id: Option<Uuid>,
        /// Replay every result in ERROR state
        #[arg(long, conflicts_with = "result_id")]
        all_failed: bool,
    },
    /// Remove duplicate organization cache rows that share a website
    RepairOrgCache,
    /// Delete a member and remember its identities so they are never re-ingested
    EraseMember { tenant: Uuid, member: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting cdp-sink");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = SinkConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;
    let root_folder = cdp_common::config::resolve_root_folder(
        args.root_folder.as_deref(),
        "CDP_ROOT_FOLDER",
        args.config.as_deref(),
    );
    let db_path = config.database_file(&root_folder);
    info!("Database: {}", db_path.display());

    let db_pool = cdp_sink::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let event_bus = EventBus::new(1000);
    let sync = Arc::new(EventBusSync::new(event_bus.clone()));

    let arbiter = HttpArbitrationClient::from_config(&config.arbitration)
        .context("Failed to build arbitration client")?
        .map(|client| Arbiter::new(Arc::new(client)));
    if arbiter.is_none() {
        info!("No arbitration endpoint configured, conflicting enrichment values stay unset");
    }

    // Providers are registered by deployments that hold credentials for them
    let state = AppState::new(db_pool, &config, event_bus, sync, Vec::new(), arbiter);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(state, &config).await,
        Command::Replay { result_id, all_failed } => replay(state, &config, result_id, all_failed).await,
        Command::RepairOrgCache => {
            let removed = repair_organization_cache(&state.db, CACHE_REPAIR_BATCH).await?;
            info!(removed, "Organization cache repaired");
            Ok(())
        }
        Command::EraseMember { tenant, member } => {
            state.ingest.erase_member(tenant, member).await?;
            Ok(())
        }
    }
}

async fn run(state: AppState, config: &SinkConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let (sender, rx) = ingest::channel(config.queue_capacity);

    let worker = QueueWorker::new(Arc::clone(&state.ingest), &sender, config.delayed_sweep_batch);
    let worker_handle = tokio::spawn(worker.run(rx, config.max_concurrent_workers, cancel.clone()));

    let sweeper = ingest::spawn_delayed_sweeper(
        sender.clone(),
        Duration::from_secs(config.delayed_sweep_interval_secs.max(1)),
        cancel.clone(),
    );

    let scheduler = if config.enrichment.enabled {
        let scheduler = EnrichmentScheduler::new(Arc::clone(&state.enrichment), &config.enrichment);
        Some(scheduler.spawn(cancel.clone()))
    } else {
        info!("Member enrichment disabled");
        None
    };

    // Pick up results left PENDING, or abandoned mid-processing, by a previous run
    let stale = state.ingest.recover_stale_processing(REPLAY_BATCH).await?;
    if !stale.is_empty() {
        info!(count = stale.len(), "Released results stuck in processing");
    }
    let pending = cdp_sink::db::results::ids_in_state(
        &state.db,
        cdp_common::events::ResultState::Pending,
        REPLAY_BATCH,
    )
    .await?;
    if !pending.is_empty() {
        info!(count = pending.len(), "Requeueing pending results");
        for id in pending {
            sender.send(QueueMessage::ProcessResult(id)).await?;
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    cancel.cancel();
    drop(sender);
    sweeper.await.context("Delayed sweeper panicked")?;
    if let Some(scheduler) = scheduler {
        scheduler.await.context("Enrichment scheduler panicked")?;
    }
    worker_handle.await.context("Queue worker panicked")?;

    info!("Shutdown complete");
    Ok(())
}

async fn replay(state: AppState, config: &SinkConfig, result_id: Option<Uuid>, all_failed: bool) -> Result<()> {
    let ids = match (result_id, all_failed) {
        (Some(id), _) => {
            if state.ingest.replay_result(id).await? {
                vec![id]
            } else {
                Vec::new()
            }
        }
        (None, true) => state.ingest.replay_failed_results(REPLAY_BATCH).await?,
        (None, false) => anyhow::bail!("Pass a result id or --all-failed"),
    };
    if ids.is_empty() {
        info!("Nothing to replay");
        return Ok(());
    }

    let (sender, rx) = ingest::channel(config.queue_capacity);
    let worker = QueueWorker::new(Arc::clone(&state.ingest), &sender, config.delayed_sweep_batch);
    let worker_handle = tokio::spawn(worker.run(rx, config.max_concurrent_workers, CancellationToken::new()));

    let count = ids.len();
    for id in ids {
        sender.send(QueueMessage::ProcessResult(id)).await?;
    }
    // Worker exits once the queue drains
    drop(sender);
    worker_handle.await.context("Queue worker panicked")?;

    info!(count, "Replay finished");
    Ok(())
}
