//! Command-line interface for the workspace worker
//!
//! Every command prints its result as JSON on stdout so schedulers and
//! monitoring can consume it.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use ws_metering::UsageMeter;
use ws_queue::{JobKind, JobPayload};

use crate::config::Config;
use crate::reaper::{start_reaper_task, Reaper};
use crate::services;
use crate::worker::{start_worker_task, Worker};

#[derive(Parser)]
#[command(name = "ws-worker")]
#[command(about = "Lifecycle worker for hosted workspaces")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the job worker and reaper until interrupted
    Worker,
    /// Queue a lifecycle job for a workspace
    Enqueue {
        /// Job kind: provision or destroy
        kind: JobKind,
        /// Workspace to act on
        workspace_id: String,
        /// Owner of the workspace
        #[arg(long)]
        user: String,
        /// Known provider instance id
        #[arg(long)]
        instance_id: Option<String>,
        /// Known provider volume id
        #[arg(long)]
        volume_id: Option<String>,
        /// Known mesh device id
        #[arg(long)]
        mesh_device_id: Option<String>,
        /// Destroy only: delete the workspace record and its volume
        #[arg(long)]
        delete_record: bool,
    },
    /// Show queue depths and pending jobs
    Queue {
        /// Maximum jobs listed per queue
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Record one usage sample for every active resource
    Meter {
        #[arg(value_enum)]
        resource: MeterResource,
    },
    /// Forward unsynced usage events to the payment processor
    SyncUsage,
    /// Requeue stranded jobs and purge expired capture tokens once
    Reap,
    /// Apply database migrations and exit
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MeterResource {
    Compute,
    Storage,
}

/// Execute the CLI command
pub async fn run(config: Config) -> Result<()> {
    let cli = Cli::parse();
    handle_command(cli.command, config).await
}

async fn handle_command(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Worker => handle_worker(config).await,

        Commands::Enqueue {
            kind,
            workspace_id,
            user,
            instance_id,
            volume_id,
            mesh_device_id,
            delete_record,
        } => {
            let payload = JobPayload {
                instance_id,
                volume_id,
                mesh_device_id,
                delete_record,
                ..JobPayload::new(workspace_id, user)
            };
            handle_enqueue(config, kind, payload).await
        }

        Commands::Queue { limit } => handle_queue(config, limit).await,

        Commands::Meter { resource } => handle_meter(config, resource).await,

        Commands::SyncUsage => handle_sync_usage(config).await,

        Commands::Reap => handle_reap(config).await,

        Commands::Migrate => handle_migrate(config).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_worker(config: Config) -> Result<()> {
    let pool = services::open_database(&config).await?;
    let queue = services::connect_queue(&config).await?;
    let orchestrators = services::orchestrators(&config, pool.clone())?;

    let worker = Arc::new(
        Worker::new(
            queue.clone(),
            orchestrators.provisioner,
            orchestrators.destroyer,
            config.max_attempts,
        )
        .with_heartbeat(config.lease_heartbeat()),
    );
    let reaper = Reaper::new(
        queue,
        services::credential_store(&config, pool)?,
        config.stale_after(),
        config.max_attempts,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_attempts = config.max_attempts,
        lease_heartbeat_secs = config.lease_heartbeat().as_secs(),
        "Starting ws-worker"
    );

    tokio::spawn(start_reaper_task(reaper, config.reaper_interval_secs));
    let worker_task = tokio::spawn(start_worker_task(worker, config.poll_interval()));

    signal::ctrl_c().await?;
    info!("Shutdown requested, stopping worker");
    worker_task.abort();

    Ok(())
}

async fn handle_enqueue(config: Config, kind: JobKind, payload: JobPayload) -> Result<()> {
    let queue = services::connect_queue(&config).await?;
    let job = queue.enqueue(kind, payload).await?;
    print_json(&job)
}

async fn handle_queue(config: Config, limit: usize) -> Result<()> {
    let queue = services::connect_queue(&config).await?;

    let mut queues = serde_json::Map::new();
    for kind in JobKind::ALL {
        queues.insert(
            kind.to_string(),
            json!({
                "length": queue.queue_length(kind).await?,
                "jobs": queue.list_jobs(kind, limit).await?,
            }),
        );
    }

    print_json(&json!({
        "queues": queues,
        "processing": {
            "length": queue.processing_length().await?,
            "jobs": queue.list_processing(limit).await?,
        },
    }))
}

async fn handle_meter(config: Config, resource: MeterResource) -> Result<()> {
    let pool = services::open_database(&config).await?;
    let meter = UsageMeter::new(pool);

    let report = match resource {
        MeterResource::Compute => meter.record_compute_usage(Utc::now()).await?,
        MeterResource::Storage => meter.record_storage_usage(Utc::now()).await?,
    };
    print_json(&report)
}

async fn handle_sync_usage(config: Config) -> Result<()> {
    let pool = services::open_database(&config).await?;
    let processor = services::metering_processor(&config)?;
    let meter = UsageMeter::new(pool);

    let report = meter
        .sync_pending_events(&processor, config.sync_batch_size, config.sync_max_attempts)
        .await?;
    print_json(&report)
}

async fn handle_reap(config: Config) -> Result<()> {
    let pool = services::open_database(&config).await?;
    let queue = services::connect_queue(&config).await?;
    let reaper = Reaper::new(
        queue,
        services::credential_store(&config, pool)?,
        config.stale_after(),
        config.max_attempts,
    );

    print_json(&reaper.run_once().await?)
}

async fn handle_migrate(config: Config) -> Result<()> {
    let pool = services::open_database(&config).await?;
    pool.close().await;
    print_json(&json!({ "migrated": config.db_path }))
}
