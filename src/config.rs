use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EmberError;
use crate::Result;

/// Tunables for the storage engine.
///
/// The retry knobs are deliberately parameters rather than constants so tests
/// can run the busy path with millisecond delays.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    #[serde(default = "default_busy_backoff_base_ms")]
    pub busy_backoff_base_ms: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    /// Snapshot after every N successful writes; 0 disables the cadence.
    /// Destructive operations and schema migrations always snapshot first.
    #[serde(default = "default_backup_every_ops")]
    pub backup_every_ops: u64,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_max_session_name_len")]
    pub max_session_name_len: usize,
}

fn default_busy_timeout_ms() -> u32 {
    5_000
}

fn default_max_write_attempts() -> u32 {
    3
}

fn default_busy_backoff_base_ms() -> u64 {
    100
}

fn default_max_backups() -> usize {
    5
}

fn default_backup_every_ops() -> u64 {
    250
}

fn default_max_message_len() -> usize {
    5_000
}

fn default_max_session_name_len() -> usize {
    100
}

impl StoreConfig {
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let backup_dir = db_path
            .parent()
            .map(|parent| parent.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"));
        Self {
            db_path,
            backup_dir,
            busy_timeout_ms: default_busy_timeout_ms(),
            max_write_attempts: default_max_write_attempts(),
            busy_backoff_base_ms: default_busy_backoff_base_ms(),
            max_backups: default_max_backups(),
            backup_every_ops: default_backup_every_ops(),
            max_message_len: default_max_message_len(),
            max_session_name_len: default_max_session_name_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_max_requests() -> usize {
    30
}

fn default_window_seconds() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Whole-fact character budget for the prompt summary.
    #[serde(default = "default_summary_budget")]
    pub summary_budget: usize,
    #[serde(default = "default_max_fact_len")]
    pub max_fact_len: usize,
    #[serde(default = "default_max_interests")]
    pub max_interests: usize,
    #[serde(default = "default_max_notes")]
    pub max_notes: usize,
}

fn default_summary_budget() -> usize {
    600
}

fn default_max_fact_len() -> usize {
    1_000
}

fn default_max_interests() -> usize {
    12
}

fn default_max_notes() -> usize {
    50
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            summary_budget: default_summary_budget(),
            max_fact_len: default_max_fact_len(),
            max_interests: default_max_interests(),
            max_notes: default_max_notes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Config {
    /// Defaults rooted in the platform data directory.
    pub fn convention_defaults() -> Self {
        Self {
            store: StoreConfig {
                backup_dir: crate::runtime_paths::default_backup_dir(),
                ..StoreConfig::at(crate::runtime_paths::default_db_path())
            },
            rate_limit: RateLimitConfig::default(),
            memory: MemoryConfig::default(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|e| EmberError::Config(format!("read {}: {e}", path.as_ref().display())))?;
        serde_json::from_str(&raw).map_err(|e| EmberError::Config(e.to_string()))
    }
}
