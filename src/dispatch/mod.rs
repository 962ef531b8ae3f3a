//! Batched dispatch loop: drains the durable queue and fans each message out
//! to its enabled mappings.
//!
//! Messages within a batch are processed concurrently and independently; one
//! item's failure never cancels its siblings. Shutdown is cooperative: the
//! loop observes the watch flag between batches, finishes the in-flight
//! batch and flushes the recovery snapshot before returning. The dequeue
//! call itself is never raced against shutdown, a popped payload must always
//! reach processing.

use crate::bus::{Message, MessageStatus};
use crate::config::PipelineConfig;
use crate::dedup::Deduplicator;
use crate::limiter::RateLimiter;
use crate::queue::DurableQueue;
use crate::recovery::RecoveryStore;
use crate::senders::{Payload, SenderRegistry};
use crate::store::SqliteStore;
use anyhow::{Context, Result};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause after a failed dequeue round so a broken broker does not busy-loop.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct DispatchWorker {
    queue: Arc<DurableQueue>,
    store: Arc<SqliteStore>,
    dedup: Arc<Deduplicator>,
    limiter: Arc<RateLimiter>,
    senders: Arc<SenderRegistry>,
    recovery: Arc<RecoveryStore>,
    batch_size: usize,
    batch_first_timeout: Duration,
    save_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl DispatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<DurableQueue>,
        store: Arc<SqliteStore>,
        dedup: Arc<Deduplicator>,
        limiter: Arc<RateLimiter>,
        senders: Arc<SenderRegistry>,
        recovery: Arc<RecoveryStore>,
        config: &PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            dedup,
            limiter,
            senders,
            recovery,
            batch_size: config.batch_size.max(1),
            batch_first_timeout: Duration::from_secs_f64(
                config.batch_first_timeout_seconds.max(0.0),
            ),
            save_interval: Duration::from_secs(config.recovery_save_interval_seconds),
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("dispatch worker started (batch size {})", self.batch_size);
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if self.queue.has_fallback() {
                match self.queue.recover_fallback().await {
                    Ok(_) => {}
                    Err(e) => warn!("fallback recovery pass failed: {}", e),
                }
            }

            let batch = match self
                .queue
                .dequeue_batch(self.batch_size, self.batch_first_timeout)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!("dequeue failed: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            if !batch.is_empty() {
                debug!("processing batch of {}", batch.len());
                let results = join_all(batch.iter().map(|m| self.process_message(m))).await;
                for (message, result) in batch.iter().zip(results) {
                    if let Err(e) = result {
                        error!("failed to process message {}: {:#}", message.id, e);
                    }
                }
            }

            if let Err(e) = self.recovery.flush_if_due(self.save_interval) {
                warn!("recovery snapshot flush failed: {}", e);
            }
        }

        if let Err(e) = self.recovery.flush() {
            error!("final recovery snapshot flush failed: {}", e);
        }
        info!("dispatch worker stopped");
    }

    /// Fan one message out to every enabled mapping of its source channel.
    ///
    /// The dedup claim happens before any send. A crash after the claim is
    /// covered by the recovery snapshot, whose replay releases the claim
    /// again; double-claiming is the failure mode being excluded here, not
    /// double-sending.
    async fn process_message(&self, message: &Message) -> Result<()> {
        if self
            .dedup
            .is_duplicate(&message.id)
            .context("dedup lookup failed")?
        {
            debug!("skipping duplicate message {}", message.id);
            return Ok(());
        }
        self.dedup
            .mark_processed(&message.id)
            .context("dedup claim failed")?;
        self.recovery.track(message)?;

        self.store.record_message(message, MessageStatus::Pending)?;
        self.store
            .set_message_status(&message.id, MessageStatus::Processing)?;

        let mappings = self
            .store
            .enabled_mappings_for_source(&message.source_channel_id)?;
        if mappings.is_empty() {
            warn!(
                "no enabled mapping for source channel {}, dropping message {}",
                message.source_channel_id, message.id
            );
            self.store
                .set_message_status(&message.id, MessageStatus::Failed)?;
            self.recovery.untrack(&message.id)?;
            return Ok(());
        }

        let payload = Payload::from(message);
        let mut delivered = 0usize;
        for mapping in &mappings {
            self.limiter
                .acquire(&mapping.target_platform, &mapping.target_bot_id)
                .await;
            match self.senders.send_to(mapping, &payload).await {
                Ok(()) => {
                    debug!(
                        "delivered message {} to {}:{}",
                        message.id, mapping.target_platform, mapping.target_channel_id
                    );
                    self.store.delete_attempt(&message.id, mapping.id)?;
                    delivered += 1;
                }
                Err(e) => {
                    warn!(
                        "delivery of {} to {}:{} failed: {}",
                        message.id, mapping.target_platform, mapping.target_channel_id, e
                    );
                    self.store
                        .record_dispatch_failure(&message.id, mapping.id, &e.to_string())?;
                }
            }
        }

        let status = if delivered == mappings.len() {
            MessageStatus::Success
        } else {
            MessageStatus::Failed
        };
        self.store.set_message_status(&message.id, status)?;
        self.recovery.untrack(&message.id)?;

        info!(
            "message {} dispatched to {}/{} mappings",
            message.id,
            delivered,
            mappings.len()
        );
        Ok(())
    }
}
