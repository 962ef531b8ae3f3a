//! Relational store for the delivery pipeline: message audit log, channel
//! mappings, the retryable delivery-attempt ledger and durable dedup records.

use crate::bus::{Message, MessageStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// One configured route from a source channel to a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMapping {
    pub id: i64,
    pub source_channel_id: String,
    pub target_platform: String,
    pub target_bot_id: String,
    pub target_channel_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewMapping {
    pub source_channel_id: String,
    pub target_platform: String,
    pub target_bot_id: String,
    pub target_channel_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    PendingRetry,
    Retrying,
    PermanentlyFailed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::PendingRetry => "pending-retry",
            AttemptStatus::Retrying => "retrying",
            AttemptStatus::PermanentlyFailed => "permanently-failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending-retry" => Some(AttemptStatus::PendingRetry),
            "retrying" => Some(AttemptStatus::Retrying),
            "permanently-failed" => Some(AttemptStatus::PermanentlyFailed),
            _ => None,
        }
    }
}

/// The retryable unit of work for a (message, mapping) pair.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub message_id: String,
    pub mapping_id: i64,
    pub retry_count: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: AttemptStatus,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Row image before timestamp/status decoding.
struct RawAttempt {
    message_id: String,
    mapping_id: i64,
    retry_count: u32,
    last_attempt_at: String,
    last_error: Option<String>,
    status: String,
}

impl RawAttempt {
    fn into_attempt(self) -> Result<DeliveryAttempt> {
        Ok(DeliveryAttempt {
            message_id: self.message_id,
            mapping_id: self.mapping_id,
            retry_count: self.retry_count,
            last_attempt_at: parse_ts(&self.last_attempt_at)?,
            last_error: self.last_error,
            status: AttemptStatus::parse(&self.status)
                .context("Unknown attempt status in store")?,
        })
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC form so TEXT comparisons order chronologically
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in store: {}", raw))
}

impl SqliteStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create database parent directory: {}",
                    parent.display()
                )
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at: {}", db_path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store
            .ensure_schema()
            .context("Failed to initialize database schema")?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                source_channel_id TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                sender TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS channel_mappings (
                id INTEGER PRIMARY KEY,
                source_channel_id TEXT NOT NULL,
                target_platform TEXT NOT NULL,
                target_bot_id TEXT NOT NULL,
                target_channel_id TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_mappings_source
             ON channel_mappings(source_channel_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS delivery_attempts (
                message_id TEXT NOT NULL,
                mapping_id INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT NOT NULL,
                last_error TEXT,
                status TEXT NOT NULL,
                PRIMARY KEY (message_id, mapping_id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_attempts_due
             ON delivery_attempts(status, last_attempt_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS dedup_records (
                message_id TEXT PRIMARY KEY,
                processed_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }

    // ---- messages ----

    /// Insert the message audit row if absent. Messages are never deleted,
    /// only superseded in status.
    pub fn record_message(&self, message: &Message, status: MessageStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO messages
             (id, source_channel_id, content, attachments, sender, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.source_channel_id,
                message.content,
                serde_json::to_string(&message.attachments)?,
                serde_json::to_string(&message.sender)?,
                status.as_str(),
                format_ts(message.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn set_message_status(&self, message_id: &str, status: MessageStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2",
            params![status.as_str(), message_id],
        )?;
        Ok(())
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, source_channel_id, content, attachments, sender, created_at
             FROM messages WHERE id = ?1",
            params![message_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?
        .map(|(id, source_channel_id, content, attachments, sender, created_at)| {
            Ok(Message {
                id,
                source_channel_id,
                content,
                attachments: serde_json::from_str(&attachments)
                    .context("Invalid attachments JSON in store")?,
                sender: serde_json::from_str(&sender).context("Invalid sender JSON in store")?,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    pub fn message_status(&self, message_id: &str) -> Result<Option<MessageStatus>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM messages WHERE id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.as_deref().and_then(MessageStatus::parse))
    }

    pub fn count_messages_with_status(&self, status: MessageStatus) -> Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ---- channel mappings ----

    pub fn insert_mapping(&self, mapping: &NewMapping) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO channel_mappings
             (source_channel_id, target_platform, target_bot_id, target_channel_id, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                mapping.source_channel_id,
                mapping.target_platform,
                mapping.target_bot_id,
                mapping.target_channel_id,
                mapping.enabled,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_mapping_enabled(&self, mapping_id: i64, enabled: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE channel_mappings SET enabled = ?1 WHERE id = ?2",
            params![enabled, mapping_id],
        )?;
        Ok(())
    }

    pub fn delete_mapping(&self, mapping_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM channel_mappings WHERE id = ?1",
            params![mapping_id],
        )?;
        Ok(())
    }

    fn mapping_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelMapping> {
        Ok(ChannelMapping {
            id: row.get(0)?,
            source_channel_id: row.get(1)?,
            target_platform: row.get(2)?,
            target_bot_id: row.get(3)?,
            target_channel_id: row.get(4)?,
            enabled: row.get(5)?,
        })
    }

    /// Enabled mappings fanning out from a source channel.
    pub fn enabled_mappings_for_source(&self, source_channel_id: &str) -> Result<Vec<ChannelMapping>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_channel_id, target_platform, target_bot_id, target_channel_id, enabled
             FROM channel_mappings WHERE source_channel_id = ?1 AND enabled = 1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![source_channel_id], Self::mapping_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_mapping(&self, mapping_id: i64) -> Result<Option<ChannelMapping>> {
        let conn = self.lock()?;
        let mapping = conn
            .query_row(
                "SELECT id, source_channel_id, target_platform, target_bot_id, target_channel_id, enabled
                 FROM channel_mappings WHERE id = ?1",
                params![mapping_id],
                Self::mapping_from_row,
            )
            .optional()?;
        Ok(mapping)
    }

    // ---- delivery attempts ----

    /// Record a failed first-dispatch for a (message, mapping) pair. Creates
    /// the attempt at `retry_count = 0`; a duplicate dispatch failure bumps
    /// the counter instead. Rows already claimed by the retry scanner or
    /// terminal are left untouched. Returns the stored retry count.
    pub fn record_dispatch_failure(
        &self,
        message_id: &str,
        mapping_id: i64,
        error: &str,
    ) -> Result<u32> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO delivery_attempts
             (message_id, mapping_id, retry_count, last_attempt_at, last_error, status)
             VALUES (?1, ?2, 0, ?3, ?4, ?5)
             ON CONFLICT(message_id, mapping_id) DO UPDATE SET
                retry_count = retry_count + 1,
                last_attempt_at = excluded.last_attempt_at,
                last_error = excluded.last_error
             WHERE delivery_attempts.status = ?5",
            params![
                message_id,
                mapping_id,
                format_ts(Utc::now()),
                error,
                AttemptStatus::PendingRetry.as_str(),
            ],
        )?;
        let count = conn.query_row(
            "SELECT retry_count FROM delivery_attempts WHERE message_id = ?1 AND mapping_id = ?2",
            params![message_id, mapping_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Guarded `pending-retry → retrying` transition. Returns false when the
    /// attempt was already claimed (or is terminal) — the single-owner rule
    /// for concurrent advancement by worker and retry paths.
    pub fn claim_attempt(&self, message_id: &str, mapping_id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE delivery_attempts SET status = ?1
             WHERE message_id = ?2 AND mapping_id = ?3 AND status = ?4",
            params![
                AttemptStatus::Retrying.as_str(),
                message_id,
                mapping_id,
                AttemptStatus::PendingRetry.as_str(),
            ],
        )?;
        Ok(updated == 1)
    }

    /// A claimed retry failed again: bump the counter and hand the attempt
    /// back to the scanner. Returns the new retry count.
    pub fn record_retry_failure(
        &self,
        message_id: &str,
        mapping_id: i64,
        error: &str,
    ) -> Result<u32> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE delivery_attempts SET
                retry_count = retry_count + 1,
                last_attempt_at = ?1,
                last_error = ?2,
                status = ?3
             WHERE message_id = ?4 AND mapping_id = ?5 AND status = ?6",
            params![
                format_ts(Utc::now()),
                error,
                AttemptStatus::PendingRetry.as_str(),
                message_id,
                mapping_id,
                AttemptStatus::Retrying.as_str(),
            ],
        )?;
        let count = conn.query_row(
            "SELECT retry_count FROM delivery_attempts WHERE message_id = ?1 AND mapping_id = ?2",
            params![message_id, mapping_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Terminal transition; the row is retained for audit and excluded from
    /// future scans.
    pub fn mark_permanently_failed(
        &self,
        message_id: &str,
        mapping_id: i64,
        reason: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE delivery_attempts SET
                status = ?1, last_error = ?2, last_attempt_at = ?3
             WHERE message_id = ?4 AND mapping_id = ?5",
            params![
                AttemptStatus::PermanentlyFailed.as_str(),
                reason,
                format_ts(Utc::now()),
                message_id,
                mapping_id,
            ],
        )?;
        debug!(
            "delivery attempt {}:{} marked permanently failed: {}",
            message_id, mapping_id, reason
        );
        Ok(())
    }

    /// Deleted on success — the pair is no longer retryable work.
    pub fn delete_attempt(&self, message_id: &str, mapping_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM delivery_attempts WHERE message_id = ?1 AND mapping_id = ?2",
            params![message_id, mapping_id],
        )?;
        Ok(())
    }

    fn attempt_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAttempt> {
        Ok(RawAttempt {
            message_id: row.get(0)?,
            mapping_id: row.get(1)?,
            retry_count: row.get(2)?,
            last_attempt_at: row.get(3)?,
            last_error: row.get(4)?,
            status: row.get(5)?,
        })
    }

    /// Attempts due for a retry pass: still pending, under the retry budget,
    /// last touched at or before `cutoff`. Oldest first, bounded.
    pub fn due_attempts(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, mapping_id, retry_count, last_attempt_at, last_error, status
             FROM delivery_attempts
             WHERE status = ?1 AND retry_count < ?2 AND last_attempt_at <= ?3
             ORDER BY last_attempt_at ASC, message_id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                AttemptStatus::PendingRetry.as_str(),
                max_retries,
                format_ts(cutoff),
                limit as i64,
            ],
            Self::attempt_from_row,
        )?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?.into_attempt()?);
        }
        Ok(attempts)
    }

    pub fn get_attempt(
        &self,
        message_id: &str,
        mapping_id: i64,
    ) -> Result<Option<DeliveryAttempt>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT message_id, mapping_id, retry_count, last_attempt_at, last_error, status
                 FROM delivery_attempts WHERE message_id = ?1 AND mapping_id = ?2",
                params![message_id, mapping_id],
                Self::attempt_from_row,
            )
            .optional()?;
        row.map(RawAttempt::into_attempt).transpose()
    }

    pub fn count_attempts_with_status(&self, status: AttemptStatus) -> Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM delivery_attempts WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ---- dedup records ----

    pub fn dedup_mark(&self, message_id: &str, ttl: chrono::Duration) -> Result<()> {
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dedup_records (message_id, processed_at, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(message_id) DO UPDATE SET expires_at = excluded.expires_at",
            params![message_id, format_ts(now), format_ts(now + ttl)],
        )?;
        Ok(())
    }

    pub fn dedup_contains(&self, message_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let hit: Option<String> = conn
            .query_row(
                "SELECT expires_at FROM dedup_records WHERE message_id = ?1",
                params![message_id],
                |row| row.get(0),
            )
            .optional()?;
        match hit {
            Some(expires_at) => Ok(parse_ts(&expires_at)? > Utc::now()),
            None => Ok(false),
        }
    }

    /// Drop the record for one id so a crash-recovery replay is not treated
    /// as a duplicate.
    pub fn dedup_remove(&self, message_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM dedup_records WHERE message_id = ?1",
            params![message_id],
        )?;
        Ok(())
    }

    pub fn dedup_purge_expired(&self) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM dedup_records WHERE expires_at <= ?1",
            params![format_ts(Utc::now())],
        )?;
        Ok(removed)
    }
}
