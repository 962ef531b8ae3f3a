// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use chrono::Utc;
use fanout::bus::{Message, SenderInfo};
use fanout::config::{PipelineConfig, RateLimitConfig};
use fanout::dedup::Deduplicator;
use fanout::dispatch::DispatchWorker;
use fanout::limiter::RateLimiter;
use fanout::queue::{Broker, DurableQueue, MemoryBroker};
use fanout::recovery::RecoveryStore;
use fanout::retry::RetryService;
use fanout::senders::{ErrorClass, MappingTarget, Payload, SendError, Sender, SenderRegistry};
use fanout::store::{NewMapping, SqliteStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

/// Sender that records every call and fails on demand, per message id or
/// per target channel.
#[derive(Default)]
pub struct MockSender {
    calls: Mutex<Vec<(String, String)>>,
    failing_messages: Mutex<HashSet<String>>,
    failing_channels: Mutex<HashSet<String>>,
}

impl MockSender {
    pub fn fail_message(&self, message_id: &str) {
        self.failing_messages
            .lock()
            .unwrap()
            .insert(message_id.to_string());
    }

    pub fn fail_channel(&self, channel_id: &str) {
        self.failing_channels
            .lock()
            .unwrap()
            .insert(channel_id.to_string());
    }

    pub fn heal(&self) {
        self.failing_messages.lock().unwrap().clear();
        self.failing_channels.lock().unwrap().clear();
    }

    /// Recorded `(channel_id, message_id)` pairs, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Sender for MockSender {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, target: &MappingTarget, payload: &Payload) -> Result<(), SendError> {
        self.calls
            .lock()
            .unwrap()
            .push((target.channel_id.clone(), payload.message_id.clone()));
        let fails = self
            .failing_messages
            .lock()
            .unwrap()
            .contains(&payload.message_id)
            || self
                .failing_channels
                .lock()
                .unwrap()
                .contains(&target.channel_id);
        if fails {
            return Err(SendError::new(ErrorClass::Transient, "scripted failure"));
        }
        Ok(())
    }
}

/// Broker that fails the first `fail_pushes` pushes, then delegates to an
/// in-memory broker.
pub struct FlakyBroker {
    inner: MemoryBroker,
    fail_pushes: AtomicUsize,
}

impl FlakyBroker {
    pub fn failing(count: usize) -> Self {
        Self {
            inner: MemoryBroker::new(),
            fail_pushes: AtomicUsize::new(count),
        }
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn push(&self, payload: String) -> anyhow::Result<()> {
        let remaining = self.fail_pushes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_pushes.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connection refused");
        }
        self.inner.push(payload).await
    }

    async fn pop(&self, timeout: Duration) -> anyhow::Result<Option<String>> {
        self.inner.pop(timeout).await
    }

    async fn len(&self) -> anyhow::Result<usize> {
        self.inner.len().await
    }
}

pub fn message(id: &str, source: &str) -> Message {
    Message {
        id: id.to_string(),
        source_channel_id: source.to_string(),
        content: format!("body {}", id),
        attachments: vec![],
        sender: SenderInfo {
            id: "u1".to_string(),
            display_name: "User".to_string(),
        },
        created_at: Utc::now(),
    }
}

pub fn add_mapping(store: &SqliteStore, source: &str, channel: &str) -> i64 {
    store
        .insert_mapping(&NewMapping {
            source_channel_id: source.to_string(),
            target_platform: "mock".to_string(),
            target_bot_id: "bot-1".to_string(),
            target_channel_id: channel.to_string(),
            enabled: true,
        })
        .unwrap()
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until(predicate: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

/// A fully wired pipeline over a temp directory. `restart` rebuilds every
/// component over the same directory, modeling a process restart: the
/// database, fallback files and recovery snapshots survive, in-memory state
/// does not.
pub struct TestPipeline {
    pub tmp: TempDir,
    pub store: Arc<SqliteStore>,
    pub queue: Arc<DurableQueue>,
    pub dedup: Arc<Deduplicator>,
    pub limiter: Arc<RateLimiter>,
    pub senders: Arc<SenderRegistry>,
    pub recovery: Arc<RecoveryStore>,
    pub mock: Arc<MockSender>,
    pub config: PipelineConfig,
    pub shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TestPipeline {
    pub fn new() -> Self {
        Self::build(TempDir::new().unwrap(), Arc::new(MemoryBroker::new()))
    }

    pub fn with_broker(broker: Arc<dyn Broker>) -> Self {
        Self::build(TempDir::new().unwrap(), broker)
    }

    pub fn restart(self) -> Self {
        Self::build(self.tmp, Arc::new(MemoryBroker::new()))
    }

    fn build(tmp: TempDir, broker: Arc<dyn Broker>) -> Self {
        let store = Arc::new(SqliteStore::new(tmp.path().join("fanout.db")).unwrap());
        let queue = Arc::new(DurableQueue::new(broker, tmp.path().join("fallback")).unwrap());
        let config = PipelineConfig {
            batch_first_timeout_seconds: 0.05,
            recovery_save_interval_seconds: 0,
            retry_interval_seconds: 1,
            ..PipelineConfig::default()
        };
        let dedup = Arc::new(Deduplicator::new(store.clone(), 64, 7));
        let limiter = Arc::new(RateLimiter::new(
            &HashMap::new(),
            &RateLimitConfig {
                calls: 1000,
                period_seconds: 60.0,
            },
        ));
        let mock = Arc::new(MockSender::default());
        let mut registry = SenderRegistry::new();
        registry.register("mock", mock.clone());
        let senders = Arc::new(registry);
        let recovery = Arc::new(RecoveryStore::new(tmp.path().join("snapshots")).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            tmp,
            store,
            queue,
            dedup,
            limiter,
            senders,
            recovery,
            mock,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn spawn_worker(&self) -> tokio::task::JoinHandle<()> {
        let worker = DispatchWorker::new(
            self.queue.clone(),
            self.store.clone(),
            self.dedup.clone(),
            self.limiter.clone(),
            self.senders.clone(),
            self.recovery.clone(),
            &self.config,
            self.shutdown_rx.clone(),
        );
        tokio::spawn(worker.run())
    }

    pub fn retry_service(&self) -> RetryService {
        RetryService::new(
            self.store.clone(),
            self.dedup.clone(),
            self.limiter.clone(),
            self.senders.clone(),
            &self.config,
            self.shutdown_rx.clone(),
        )
    }

    pub async fn stop_worker(&self, handle: tokio::task::JoinHandle<()>) {
        let _ = self.shutdown_tx.send(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop after shutdown signal")
            .unwrap();
    }
}
