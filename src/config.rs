use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    CROSS_SOURCE_WINDOW_SECS, DUPLICATE_BODY_PREFIX_CHARS, NOTIFICATION_RETENTION_DAYS,
    READ_CACHE_CAPACITY, SAME_SOURCE_WINDOW_SECS, TOMBSTONE_CAPACITY,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backing message store (poll + mark-read)
    #[serde(default)]
    pub store: StoreConfig,
    /// Fuzzy duplicate detection thresholds
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub threads: ThreadConfig,
    /// Local read-state cache
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token sent with every store request
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// On-demand polls closer together than this are coalesced
    #[serde(default = "default_min_poll_interval_secs")]
    pub min_poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
            poll_interval_secs: default_poll_interval_secs(),
            min_poll_interval_secs: default_min_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_secs(self.min_poll_interval_secs)
    }
}

/// Heuristic thresholds for collapsing push/poll duplicates.
/// These are empirical, so they live in config rather than code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupConfig {
    #[serde(default = "default_body_prefix_chars")]
    pub body_prefix_chars: usize,
    /// Tolerance for repeats from the same source (poll/poll, push/push)
    #[serde(default = "default_same_source_window_secs")]
    pub same_source_window_secs: i64,
    /// Tolerance for push vs. poll races
    #[serde(default = "default_cross_source_window_secs")]
    pub cross_source_window_secs: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            body_prefix_chars: default_body_prefix_chars(),
            same_source_window_secs: default_same_source_window_secs(),
            cross_source_window_secs: default_cross_source_window_secs(),
        }
    }
}

/// Which message wins the thread preview when timestamps tie.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PreviewTieBreak {
    #[default]
    Sent,
    Received,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadConfig {
    #[serde(default)]
    pub preview_tie_break: PreviewTieBreak,
    /// Most recently active threads kept in memory
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_preview_length")]
    pub preview_length: usize,
    /// Deleted ids remembered so stray events cannot bring them back
    #[serde(default = "default_max_tombstones")]
    pub max_tombstones: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            preview_tie_break: PreviewTieBreak::default(),
            max_threads: default_max_threads(),
            preview_length: default_preview_length(),
            max_tombstones: default_max_tombstones(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Persisted read ids beyond this are evicted oldest first
    #[serde(default = "default_read_cache_capacity")]
    pub read_cache_capacity: usize,
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,
    #[serde(default = "default_persist_retry_delay_ms")]
    pub persist_retry_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            read_cache_capacity: default_read_cache_capacity(),
            persist_retries: default_persist_retries(),
            persist_retry_delay_ms: default_persist_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Enable desktop notifications for new inbound messages
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Show the message preview in the notification body
    #[serde(default = "default_true")]
    pub show_preview: bool,
    /// Threads quieter than this are left out of the notification feed
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            show_preview: true,
            retention_days: default_retention_days(),
        }
    }
}

impl NotificationConfig {
    pub fn retention_secs(&self) -> i64 {
        self.retention_days.saturating_mul(24 * 60 * 60)
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_min_poll_interval_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_body_prefix_chars() -> usize {
    DUPLICATE_BODY_PREFIX_CHARS
}

fn default_same_source_window_secs() -> i64 {
    SAME_SOURCE_WINDOW_SECS
}

fn default_cross_source_window_secs() -> i64 {
    CROSS_SOURCE_WINDOW_SECS
}

fn default_max_threads() -> usize {
    500
}

fn default_preview_length() -> usize {
    100
}

fn default_max_tombstones() -> usize {
    TOMBSTONE_CAPACITY
}

fn default_read_cache_capacity() -> usize {
    READ_CACHE_CAPACITY
}

fn default_persist_retries() -> u32 {
    3
}

fn default_persist_retry_delay_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> i64 {
    NOTIFICATION_RETENTION_DAYS
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("crm-inbox");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("crm-inbox");
        Ok(dir)
    }

    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        fs::create_dir_all(Self::data_dir()?)?;
        Ok(())
    }
}
