//! Periodic retry scanner for failed delivery attempts.
//!
//! Every interval it claims a bounded batch of pending attempts, oldest
//! first, and re-sends each through the same sender and rate-limiter path as
//! first dispatch. The claim is a guarded status transition in the store, so
//! a scan and a concurrent dispatch round never advance the same attempt.
//!
//! The scan is blind to error classification: every non-terminal failure is
//! retried on the same fixed interval until the budget runs out. The
//! classified error string is persisted with each attempt, which leaves room
//! for a class-aware policy without a schema change.

use crate::config::PipelineConfig;
use crate::dedup::Deduplicator;
use crate::limiter::RateLimiter;
use crate::senders::{Payload, SenderRegistry};
use crate::store::{DeliveryAttempt, SqliteStore};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct RetryService {
    store: Arc<SqliteStore>,
    dedup: Arc<Deduplicator>,
    limiter: Arc<RateLimiter>,
    senders: Arc<SenderRegistry>,
    interval: Duration,
    interval_chrono: chrono::Duration,
    scan_limit: usize,
    max_retries: u32,
    shutdown: watch::Receiver<bool>,
}

impl RetryService {
    pub fn new(
        store: Arc<SqliteStore>,
        dedup: Arc<Deduplicator>,
        limiter: Arc<RateLimiter>,
        senders: Arc<SenderRegistry>,
        config: &PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let secs = config.retry_interval_seconds.max(1);
        Self {
            store,
            dedup,
            limiter,
            senders,
            interval: Duration::from_secs(secs),
            interval_chrono: chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)),
            scan_limit: config.retry_scan_limit.max(1),
            max_retries: config.max_retries,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(
            "retry service started (interval {}s, budget {})",
            self.interval.as_secs(),
            self.max_retries
        );
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.scan_once().await {
                Ok(0) => {}
                Ok(n) => info!("retry scan recovered {} deliveries", n),
                Err(e) => error!("retry scan failed: {}", e),
            }

            // Piggyback housekeeping on the retry cadence
            if let Err(e) = self.dedup.purge_expired() {
                warn!("dedup purge failed: {}", e);
            }
        }
        info!("retry service stopped");
    }

    /// One scan pass. Returns the number of deliveries that succeeded.
    pub async fn scan_once(&self) -> Result<usize> {
        self.scan_from(Utc::now() - self.interval_chrono).await
    }

    async fn scan_from(&self, cutoff: chrono::DateTime<Utc>) -> Result<usize> {
        let due = self
            .store
            .due_attempts(cutoff, self.max_retries, self.scan_limit)?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!("retry scan found {} due attempts", due.len());

        let mut recovered = 0;
        for attempt in due {
            if !self
                .store
                .claim_attempt(&attempt.message_id, attempt.mapping_id)?
            {
                // Another path advanced this attempt since the query
                continue;
            }
            if self.retry_attempt(&attempt).await? {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn retry_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool> {
        let Some(mapping) = self.store.get_mapping(attempt.mapping_id)? else {
            self.store.mark_permanently_failed(
                &attempt.message_id,
                attempt.mapping_id,
                "mapping removed",
            )?;
            return Ok(false);
        };
        if !mapping.enabled {
            self.store.mark_permanently_failed(
                &attempt.message_id,
                attempt.mapping_id,
                "mapping disabled",
            )?;
            return Ok(false);
        }
        let Some(message) = self.store.get_message(&attempt.message_id)? else {
            self.store.mark_permanently_failed(
                &attempt.message_id,
                attempt.mapping_id,
                "message record missing",
            )?;
            return Ok(false);
        };

        let payload = Payload::from(&message);
        self.limiter
            .acquire(&mapping.target_platform, &mapping.target_bot_id)
            .await;
        match self.senders.send_to(&mapping, &payload).await {
            Ok(()) => {
                info!(
                    "retry delivered message {} to {}:{} after {} failures",
                    attempt.message_id,
                    mapping.target_platform,
                    mapping.target_channel_id,
                    attempt.retry_count + 1
                );
                self.store
                    .delete_attempt(&attempt.message_id, attempt.mapping_id)?;
                Ok(true)
            }
            Err(e) => {
                let count = self.store.record_retry_failure(
                    &attempt.message_id,
                    attempt.mapping_id,
                    &e.to_string(),
                )?;
                if count >= self.max_retries {
                    warn!(
                        "retry budget exhausted for {}:{}, giving up: {}",
                        attempt.message_id, attempt.mapping_id, e
                    );
                    self.store.mark_permanently_failed(
                        &attempt.message_id,
                        attempt.mapping_id,
                        &format!("retry budget exhausted: {}", e),
                    )?;
                } else {
                    debug!(
                        "retry {}/{} for {}:{} failed: {}",
                        count, self.max_retries, attempt.message_id, attempt.mapping_id, e
                    );
                }
                Ok(false)
            }
        }
    }
}
