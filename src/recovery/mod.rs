//! Crash-recovery snapshot store.
//!
//! Messages are tracked from the moment the worker claims them until their
//! final status is written. The pending set is flushed to a session-scoped
//! JSON-lines snapshot on an interval and unconditionally at shutdown; a
//! restart reloads the newest snapshot left by a previous session and
//! re-enqueues its messages. Lines are versioned so an incompatible change
//! to the message shape invalidates old snapshots instead of corrupting the
//! replay.

use crate::bus::Message;
use crate::utils;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_EXT: &str = "jsonl";

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    version: u32,
    message: Message,
}

pub struct RecoveryStore {
    snapshot_dir: PathBuf,
    session_path: PathBuf,
    pending: Mutex<HashMap<String, Message>>,
    dirty: AtomicBool,
    last_flush: Mutex<Instant>,
}

impl RecoveryStore {
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Result<Self> {
        let snapshot_dir = utils::ensure_dir(snapshot_dir.into())?;
        // Session-scoped file name; a previous session's snapshot is never
        // overwritten by this one.
        let session_path = snapshot_dir.join(format!(
            "{}{:020}.{}",
            SNAPSHOT_PREFIX,
            Utc::now().timestamp_micros(),
            SNAPSHOT_EXT
        ));
        Ok(Self {
            snapshot_dir,
            session_path,
            pending: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            last_flush: Mutex::new(Instant::now()),
        })
    }

    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Message>>> {
        self.pending
            .lock()
            .map_err(|e| anyhow::anyhow!("recovery pending lock poisoned: {}", e))
    }

    /// Add a message to the in-flight set.
    pub fn track(&self, message: &Message) -> Result<()> {
        self.lock_pending()?
            .insert(message.id.clone(), message.clone());
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove a message once its final status is recorded.
    pub fn untrack(&self, message_id: &str) -> Result<()> {
        if self.lock_pending()?.remove(message_id).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub fn pending_len(&self) -> Result<usize> {
        Ok(self.lock_pending()?.len())
    }

    /// Write the whole pending set to the session snapshot atomically. An
    /// empty set removes the file instead; a snapshot with zero lines has
    /// nothing to replay.
    pub fn flush(&self) -> Result<()> {
        let records: Vec<String> = {
            let pending = self.lock_pending()?;
            pending
                .values()
                .map(|message| {
                    serde_json::to_string(&SnapshotRecord {
                        version: SNAPSHOT_VERSION,
                        message: message.clone(),
                    })
                    .context("Failed to serialize snapshot record")
                })
                .collect::<Result<_>>()?
        };

        if records.is_empty() {
            if self.session_path.exists() {
                std::fs::remove_file(&self.session_path).with_context(|| {
                    format!(
                        "Failed to remove empty snapshot: {}",
                        self.session_path.display()
                    )
                })?;
            }
        } else {
            let mut content = records.join("\n");
            content.push('\n');
            utils::atomic_write(&self.session_path, &content)?;
            debug!("flushed {} in-flight messages to snapshot", records.len());
        }

        self.dirty.store(false, Ordering::Release);
        if let Ok(mut last) = self.last_flush.lock() {
            *last = Instant::now();
        }
        Ok(())
    }

    /// Flush only when the set changed and `interval` elapsed since the last
    /// flush. Called once per dispatch round.
    pub fn flush_if_due(&self, interval: Duration) -> Result<()> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let due = self
            .last_flush
            .lock()
            .map(|last| last.elapsed() >= interval)
            .unwrap_or(true);
        if due {
            self.flush()?;
        }
        Ok(())
    }

    fn snapshot_timestamp(path: &Path) -> Option<i64> {
        let name = path.file_name()?.to_str()?;
        let stem = name
            .strip_prefix(SNAPSHOT_PREFIX)?
            .strip_suffix(&format!(".{}", SNAPSHOT_EXT))?;
        stem.parse().ok()
    }

    fn other_snapshots(&self) -> Result<Vec<PathBuf>> {
        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(&self.snapshot_dir)
            .with_context(|| {
                format!(
                    "Failed to read snapshot directory: {}",
                    self.snapshot_dir.display()
                )
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| *p != self.session_path && Self::snapshot_timestamp(p).is_some())
            .collect();
        snapshots.sort();
        Ok(snapshots)
    }

    /// Load the newest snapshot written by a previous session, delete its
    /// file and hand the messages back for re-enqueueing. Undecodable or
    /// version-mismatched lines are skipped, not fatal; a partial replay
    /// beats none.
    pub fn load_pending(&self) -> Result<Vec<Message>> {
        let Some(newest) = self.other_snapshots()?.pop() else {
            return Ok(Vec::new());
        };

        let content = std::fs::read_to_string(&newest)
            .with_context(|| format!("Failed to read snapshot: {}", newest.display()))?;

        let mut messages = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<SnapshotRecord>(line) {
                Ok(record) if record.version == SNAPSHOT_VERSION => {
                    messages.push(record.message);
                }
                Ok(record) => {
                    warn!(
                        "skipping snapshot record with unsupported version {}",
                        record.version
                    );
                }
                Err(e) => {
                    warn!("skipping undecodable snapshot line: {}", e);
                }
            }
        }

        std::fs::remove_file(&newest)
            .with_context(|| format!("Failed to remove loaded snapshot: {}", newest.display()))?;
        if !messages.is_empty() {
            info!(
                "recovered {} in-flight messages from {}",
                messages.len(),
                newest.display()
            );
        }
        Ok(messages)
    }

    /// Delete stale snapshots from sessions older than the retention window.
    pub fn sweep(&self, retention_days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days.max(0)))
            .timestamp_micros();
        let mut removed = 0;
        for path in self.other_snapshots()? {
            let Some(ts) = Self::snapshot_timestamp(&path) else {
                continue;
            };
            if ts >= cutoff {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("failed to sweep snapshot {}: {}", path.display(), e),
            }
        }
        if removed > 0 {
            info!("swept {} stale recovery snapshots", removed);
        }
        Ok(removed)
    }
}
