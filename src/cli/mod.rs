//! Command-line entry points: `run` starts the pipeline, `status` reports
//! delivery counters from the store.

use crate::bus::{Attachment, Message, MessageStatus, SenderInfo};
use crate::config::{Config, load_config};
use crate::dedup::Deduplicator;
use crate::dispatch::DispatchWorker;
use crate::errors::{FanoutError, FanoutResult};
use crate::limiter::RateLimiter;
use crate::queue::{DurableQueue, MemoryBroker};
use crate::recovery::RecoveryStore;
use crate::retry::RetryService;
use crate::senders::{SenderRegistry, WebhookSender};
use crate::store::{AttemptStatus, SqliteStore};
use crate::utils::task_tracker::TaskTracker;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SNAPSHOT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "fanout", version)]
#[command(about = "Fan-out chat relay delivery pipeline")]
pub struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline, reading JSON messages from stdin (one per line)
    Run,
    /// Show message and delivery-attempt counters from the store
    Status,
}

pub async fn run() -> FanoutResult<()> {
    let cli = Cli::parse();
    let config = load_cli_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_pipeline(config).await,
        Commands::Status => status_command(&config),
    }
}

fn load_cli_config(path: Option<&Path>) -> FanoutResult<Config> {
    load_config(path).map_err(|e| FanoutError::Config(format!("{:#}", e)))
}

/// Inbound line format. Producers may omit the id, sender and timestamp;
/// omitted ids get a fresh UUID, which makes such lines non-idempotent by
/// construction.
#[derive(Deserialize)]
struct IngestRecord {
    #[serde(default)]
    id: Option<String>,
    source_channel_id: String,
    content: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    sender: Option<SenderInfo>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl IngestRecord {
    fn into_message(self) -> Message {
        Message {
            id: self
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            source_channel_id: self.source_channel_id,
            content: self.content,
            attachments: self.attachments,
            sender: self.sender.unwrap_or_else(|| SenderInfo {
                id: "unknown".to_string(),
                display_name: String::new(),
            }),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

fn build_senders(config: &Config) -> Result<SenderRegistry> {
    let mut registry = SenderRegistry::new();
    for (platform, sender_config) in &config.senders {
        if !sender_config.enabled {
            info!("sender for platform {} is disabled", platform);
            continue;
        }
        registry.register(
            platform.clone(),
            Arc::new(WebhookSender::new(platform, &sender_config.url)?),
        );
    }
    if registry.platforms().is_empty() {
        warn!("no senders configured, every delivery will fail permanently");
    }
    Ok(registry)
}

async fn ingest_stdin(queue: Arc<DurableQueue>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<IngestRecord>(line) {
                    Ok(record) => {
                        let message = record.into_message();
                        if let Err(e) = queue.enqueue(&message).await {
                            error!("failed to enqueue message {}: {:#}", message.id, e);
                        }
                    }
                    Err(e) => warn!("ignoring undecodable input line: {}", e),
                }
            }
            Ok(None) => {
                info!("input stream closed");
                break;
            }
            Err(e) => {
                error!("failed to read input: {}", e);
                break;
            }
        }
    }
}

async fn run_pipeline(config: Config) -> FanoutResult<()> {
    let store = Arc::new(
        SqliteStore::new(&config.storage.db_path)
            .map_err(|e| FanoutError::Store(format!("{:#}", e)))?,
    );
    let queue = Arc::new(
        DurableQueue::new(Arc::new(MemoryBroker::new()), &config.storage.fallback_dir)
            .map_err(|e| FanoutError::Broker(format!("{:#}", e)))?,
    );
    let dedup = Arc::new(Deduplicator::new(
        store.clone(),
        config.pipeline.dedup_cache_capacity,
        config.pipeline.dedup_ttl_days,
    ));
    let limiter = Arc::new(RateLimiter::new(
        &config.rate_limits,
        &config.default_rate_limit,
    ));
    let senders = Arc::new(build_senders(&config)?);
    let recovery = Arc::new(
        RecoveryStore::new(&config.storage.snapshot_dir)
            .map_err(|e| FanoutError::Snapshot(format!("{:#}", e)))?,
    );

    // Replay what a previous session left in flight. The replay releases
    // each message's dedup claim first, otherwise the worker would skip it.
    let replayed = recovery
        .load_pending()
        .map_err(|e| FanoutError::Snapshot(format!("{:#}", e)))?;
    for message in &replayed {
        dedup.forget(&message.id)?;
        queue.enqueue(message).await?;
    }
    if !replayed.is_empty() {
        info!("re-enqueued {} recovered messages", replayed.len());
    }
    if let Err(e) = recovery.sweep(config.pipeline.recovery_retention_days) {
        warn!("snapshot sweep failed: {}", e);
    }
    if let Err(e) = queue.recover_fallback().await {
        warn!("fallback recovery at startup failed: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = DispatchWorker::new(
        queue.clone(),
        store.clone(),
        dedup.clone(),
        limiter.clone(),
        senders.clone(),
        recovery.clone(),
        &config.pipeline,
        shutdown_rx.clone(),
    );
    let retry = RetryService::new(
        store.clone(),
        dedup,
        limiter,
        senders,
        &config.pipeline,
        shutdown_rx,
    );

    let worker_handle = tokio::spawn(worker.run());
    let retry_handle = tokio::spawn(retry.run());

    let tracker = TaskTracker::new();
    tracker.spawn("stdin-ingest", ingest_stdin(queue.clone())).await;
    let sweep_recovery = recovery.clone();
    let retention_days = config.pipeline.recovery_retention_days;
    tracker
        .spawn("snapshot-sweep", async move {
            loop {
                tokio::time::sleep(SNAPSHOT_SWEEP_INTERVAL).await;
                if let Err(e) = sweep_recovery.sweep(retention_days) {
                    warn!("snapshot sweep failed: {}", e);
                }
            }
        })
        .await;

    println!("fanout pipeline running (Ctrl+C to stop)");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    println!("\nShutting down...");

    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;
    let _ = retry_handle.await;
    tracker.cancel_all().await;

    info!("pipeline stopped");
    Ok(())
}

fn status_command(config: &Config) -> FanoutResult<()> {
    let store = SqliteStore::new(&config.storage.db_path)
        .map_err(|e| FanoutError::Store(format!("{:#}", e)))?;

    println!("Messages:");
    for status in [
        MessageStatus::Pending,
        MessageStatus::Processing,
        MessageStatus::Success,
        MessageStatus::Failed,
    ] {
        let count = store.count_messages_with_status(status)?;
        println!("  {:<20} {}", status.as_str(), count);
    }

    println!("Delivery attempts:");
    for status in [
        AttemptStatus::PendingRetry,
        AttemptStatus::Retrying,
        AttemptStatus::PermanentlyFailed,
    ] {
        let count = store.count_attempts_with_status(status)?;
        println!("  {:<20} {}", status.as_str(), count);
    }

    let backlog = std::fs::read_dir(&config.storage.fallback_dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0);
    println!("Fallback backlog:      {} files", backlog);

    Ok(())
}

#[cfg(test)]
mod tests;
