//! FIFO transport for inbound messages with a disk fallback.
//!
//! The broker is an abstract list-like transport keyed by a fixed queue name.
//! When it is unreachable at enqueue time, messages are parked as one JSON
//! file each under the fallback directory instead of being dropped, and
//! reloaded once the broker is reachable again. Order across fallback files
//! is not preserved relative to the live queue — the pipeline guarantees
//! per-message at-least-once delivery, not cross-message ordering.

use crate::bus::{Envelope, Message};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Immediate in-line retries before a push degrades to the fallback store.
const PUSH_ATTEMPTS: usize = 3;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn push(&self, payload: String) -> Result<()>;
    /// Blocking pop: waits up to `timeout` for an item. A zero timeout is a
    /// non-blocking poll.
    async fn pop(&self, timeout: Duration) -> Result<Option<String>>;
    async fn len(&self) -> Result<usize>;
}

/// In-process broker. The default transport; remote brokers implement the
/// same trait.
#[derive(Default)]
pub struct MemoryBroker {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, payload: String) -> Result<()> {
        self.items.lock().await.push_back(payload);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.items.lock().await.pop_front() {
                return Ok(Some(item));
            }
            if timeout.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.lock().await.len())
    }
}

/// FIFO queue with at-least-once enqueue semantics across broker outages.
pub struct DurableQueue {
    broker: Arc<dyn Broker>,
    fallback_dir: PathBuf,
    fallback_seq: AtomicU64,
}

impl DurableQueue {
    pub fn new(broker: Arc<dyn Broker>, fallback_dir: impl Into<PathBuf>) -> Result<Self> {
        let fallback_dir = fallback_dir.into();
        std::fs::create_dir_all(&fallback_dir).with_context(|| {
            format!(
                "Failed to create fallback directory: {}",
                fallback_dir.display()
            )
        })?;
        Ok(Self {
            broker,
            fallback_dir,
            fallback_seq: AtomicU64::new(0),
        })
    }

    /// Push to the broker tail; degrade to a fallback file rather than drop
    /// when the broker stays unreachable.
    pub async fn enqueue(&self, message: &Message) -> Result<()> {
        let payload = Envelope::encode(message)?;
        let mut last_err = None;
        for attempt in 1..=PUSH_ATTEMPTS {
            match self.broker.push(payload.clone()).await {
                Ok(()) => {
                    debug!("enqueued message {} (attempt {})", message.id, attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "broker push failed for {} (attempt {}/{}): {}",
                        message.id, attempt, PUSH_ATTEMPTS, e
                    );
                    last_err = Some(e);
                }
            }
        }

        let path = self.fallback_path();
        tokio::fs::write(&path, &payload)
            .await
            .with_context(|| format!("Failed to write fallback file: {}", path.display()))?;
        info!(
            "broker unreachable ({}), message {} parked at {}",
            last_err.map_or_else(String::new, |e| e.to_string()),
            message.id,
            path.display()
        );
        Ok(())
    }

    fn fallback_path(&self) -> PathBuf {
        // Monotonically sortable name: microsecond timestamp plus an
        // in-process sequence for same-tick writes.
        let seq = self.fallback_seq.fetch_add(1, Ordering::Relaxed);
        self.fallback_dir.join(format!(
            "{:020}-{:06}.json",
            Utc::now().timestamp_micros(),
            seq
        ))
    }

    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Message>> {
        match self.broker.pop(timeout).await? {
            Some(payload) => Ok(Self::decode_or_discard(&payload)),
            None => Ok(None),
        }
    }

    /// Block up to `first_timeout` for the first message, then drain
    /// non-blockingly up to `max_count`. Cuts per-message round-trips under
    /// load without adding tail latency on a near-empty queue.
    pub async fn dequeue_batch(
        &self,
        max_count: usize,
        first_timeout: Duration,
    ) -> Result<Vec<Message>> {
        let mut batch = Vec::new();
        if max_count == 0 {
            return Ok(batch);
        }

        let Some(first) = self.broker.pop(first_timeout).await? else {
            return Ok(batch);
        };
        if let Some(msg) = Self::decode_or_discard(&first) {
            batch.push(msg);
        }

        while batch.len() < max_count {
            match self.broker.pop(Duration::ZERO).await? {
                Some(payload) => {
                    if let Some(msg) = Self::decode_or_discard(&payload) {
                        batch.push(msg);
                    }
                }
                None => break,
            }
        }
        Ok(batch)
    }

    fn decode_or_discard(payload: &str) -> Option<Message> {
        match Envelope::decode(payload) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("discarding undecodable queue payload: {}", e);
                None
            }
        }
    }

    pub async fn size(&self) -> Result<usize> {
        self.broker.len().await
    }

    /// Cheap check used by the dispatch loop to decide whether a recovery
    /// pass is worth attempting.
    pub fn has_fallback(&self) -> bool {
        std::fs::read_dir(&self.fallback_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Reload parked messages into the broker and delete their files.
    /// Stops early if the broker is still unreachable; remaining files are
    /// picked up by a later pass.
    pub async fn recover_fallback(&self) -> Result<usize> {
        let mut names: Vec<PathBuf> = std::fs::read_dir(&self.fallback_dir)
            .with_context(|| {
                format!(
                    "Failed to read fallback directory: {}",
                    self.fallback_dir.display()
                )
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        names.sort();

        let mut recovered = 0;
        for path in names {
            let payload = match tokio::fs::read_to_string(&path).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("skipping unreadable fallback file {}: {}", path.display(), e);
                    continue;
                }
            };
            if let Err(e) = self.broker.push(payload).await {
                warn!("broker still unreachable during fallback recovery: {}", e);
                break;
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("failed to delete fallback file {}: {}", path.display(), e);
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!("recovered {} messages from fallback store", recovered);
        }
        Ok(recovered)
    }
}
