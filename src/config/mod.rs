use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size", rename = "batchSize")]
    pub batch_size: usize,
    #[serde(
        default = "default_batch_first_timeout",
        rename = "batchFirstTimeoutSeconds"
    )]
    pub batch_first_timeout_seconds: f64,
    #[serde(default = "default_retry_interval", rename = "retryIntervalSeconds")]
    pub retry_interval_seconds: u64,
    #[serde(default = "default_retry_scan_limit", rename = "retryScanLimit")]
    pub retry_scan_limit: usize,
    #[serde(default = "default_max_retries", rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(default = "default_dedup_ttl_days", rename = "dedupTtlDays")]
    pub dedup_ttl_days: i64,
    #[serde(default = "default_dedup_cache_capacity", rename = "dedupCacheCapacity")]
    pub dedup_cache_capacity: usize,
    #[serde(
        default = "default_recovery_save_interval",
        rename = "recoverySaveIntervalSeconds"
    )]
    pub recovery_save_interval_seconds: u64,
    #[serde(
        default = "default_recovery_retention",
        rename = "recoveryRetentionDays"
    )]
    pub recovery_retention_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_first_timeout_seconds: default_batch_first_timeout(),
            retry_interval_seconds: default_retry_interval(),
            retry_scan_limit: default_retry_scan_limit(),
            max_retries: default_max_retries(),
            dedup_ttl_days: default_dedup_ttl_days(),
            dedup_cache_capacity: default_dedup_cache_capacity(),
            recovery_save_interval_seconds: default_recovery_save_interval(),
            recovery_retention_days: default_recovery_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path", rename = "dbPath")]
    pub db_path: PathBuf,
    #[serde(default = "default_fallback_dir", rename = "fallbackDir")]
    pub fallback_dir: PathBuf,
    #[serde(default = "default_snapshot_dir", rename = "snapshotDir")]
    pub snapshot_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            fallback_dir: default_fallback_dir(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

/// Per-platform sliding-window budget: at most `calls` sends per `period`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_calls")]
    pub calls: u32,
    #[serde(default = "default_rate_period", rename = "periodSeconds")]
    pub period_seconds: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls: default_rate_calls(),
            period_seconds: default_rate_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookSenderConfig {
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Keyed by target platform name ("discord", "telegram", ...).
    #[serde(default, rename = "rateLimits")]
    pub rate_limits: HashMap<String, RateLimitConfig>,
    #[serde(default, rename = "defaultRateLimit")]
    pub default_rate_limit: RateLimitConfig,
    /// Outbound webhook endpoint per platform.
    #[serde(default)]
    pub senders: HashMap<String, WebhookSenderConfig>,
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_first_timeout() -> f64 {
    2.0
}

fn default_retry_interval() -> u64 {
    60
}

fn default_retry_scan_limit() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_dedup_ttl_days() -> i64 {
    7
}

fn default_dedup_cache_capacity() -> usize {
    4096
}

fn default_recovery_save_interval() -> u64 {
    5
}

fn default_recovery_retention() -> i64 {
    7
}

fn default_rate_calls() -> u32 {
    20
}

fn default_rate_period() -> f64 {
    60.0
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fanout.db")
}

fn default_fallback_dir() -> PathBuf {
    PathBuf::from("fallback")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = PathBuf::from("config.json");
    let path = config_path.unwrap_or(default_path.as_path());

    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?;
        return Ok(config);
    }

    Ok(Config::default())
}
