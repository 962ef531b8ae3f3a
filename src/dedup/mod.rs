//! Two-tier idempotency guard: a bounded in-process LRU cache in front of
//! durable TTL records in the relational store. The durable tier is what
//! keeps the guarantee across restarts; the cache only saves a store hit for
//! recently seen ids.

use crate::store::SqliteStore;
use anyhow::Result;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct Deduplicator {
    cache: Mutex<LruCache<String, ()>>,
    store: Arc<SqliteStore>,
    ttl: chrono::Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<SqliteStore>, cache_capacity: usize, ttl_days: i64) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            store,
            ttl: chrono::Duration::days(ttl_days.max(1)),
        }
    }

    /// Has this message id already been claimed within the TTL window?
    pub fn is_duplicate(&self, message_id: &str) -> Result<bool> {
        if let Ok(mut cache) = self.cache.lock()
            && cache.get(message_id).is_some()
        {
            return Ok(true);
        }
        if self.store.dedup_contains(message_id)? {
            // Re-warm the cache; the id aged out of the LRU but is still live
            if let Ok(mut cache) = self.cache.lock() {
                cache.put(message_id.to_string(), ());
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Claim the id. Claimed before work begins, not after — a crash mid
    /// processing must not lead to a duplicate dispatch on replay.
    pub fn mark_processed(&self, message_id: &str) -> Result<()> {
        self.store.dedup_mark(message_id, self.ttl)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(message_id.to_string(), ());
        }
        Ok(())
    }

    /// Release a claim. Used when re-enqueueing snapshot-recovered messages,
    /// whose claim predates the crash and must not suppress the replay.
    pub fn forget(&self, message_id: &str) -> Result<()> {
        self.store.dedup_remove(message_id)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(message_id);
        }
        Ok(())
    }

    /// Drop expired durable records. Called opportunistically from the retry
    /// sweep; cheap when nothing is expired.
    pub fn purge_expired(&self) -> Result<usize> {
        let removed = self.store.dedup_purge_expired()?;
        if removed > 0 {
            debug!("purged {} expired dedup records", removed);
        }
        Ok(removed)
    }
}
