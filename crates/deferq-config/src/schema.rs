//! Configuration schema definitions.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration shared by enqueuers, the worker and the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferqConfig {
    /// Directory holding the partitions, lease, heartbeat and logs.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Maximum entries claimed per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep between empty polls (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Idle time before the worker exits (seconds, 0 = never).
    #[serde(default = "default_idle_exit_secs")]
    pub idle_exit_secs: u64,

    /// Execution attempts per entry and retry cycles before an entry fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay of the exponential backoff (milliseconds).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Age after which an in-flight entry is considered orphaned (seconds).
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,

    /// Polling iterations between maintenance passes.
    #[serde(default = "default_maintenance_every")]
    pub maintenance_every: u64,

    /// Minimum spacing between heartbeat writes (seconds).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Heartbeat age at which a live worker is considered stuck (seconds).
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Lifetime of a positive health-cache entry (seconds).
    #[serde(default = "default_health_cache_ttl_secs")]
    pub health_cache_ttl_secs: u64,

    /// Age after which a startup lock is force-reclaimed (seconds).
    #[serde(default = "default_startup_lock_timeout_secs")]
    pub startup_lock_timeout_secs: u64,

    /// How long a launcher waits for the new worker's lease (milliseconds).
    #[serde(default = "default_startup_wait_timeout_ms")]
    pub startup_wait_timeout_ms: u64,

    /// Upper bound on the sequencer's lock wait (milliseconds).
    #[serde(default = "default_sequence_lock_timeout_ms")]
    pub sequence_lock_timeout_ms: u64,

    /// Event-loop read timeout (seconds).
    #[serde(default = "default_event_read_timeout_secs")]
    pub event_read_timeout_secs: u64,

    /// Watcher restarts before falling back to polling.
    #[serde(default = "default_max_watcher_restarts")]
    pub max_watcher_restarts: u32,

    /// Main loop strategy.
    #[serde(default)]
    pub loop_strategy: LoopStrategyKind,

    /// Retention of completed entries (seconds).
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,

    /// Retention of failed entries (seconds).
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,

    /// fsync staging files before they are committed to `pending/`.
    #[serde(default)]
    pub durable_writes: bool,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Worker main-loop selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopStrategyKind {
    /// Event-driven when a watcher can be started, polling otherwise.
    #[default]
    Auto,
    Polling,
    Event,
}

impl std::str::FromStr for LoopStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "polling" | "poll" => Ok(Self::Polling),
            "event" | "events" => Ok(Self::Event),
            other => Err(format!("unknown loop strategy '{}'", other)),
        }
    }
}

/// Backing store adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// SQLite database file opened in-process.
    #[default]
    Sqlite,
    /// External command fed the batch on stdin.
    Command,
}

impl std::str::FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "command" => Ok(Self::Command),
            other => Err(format!("unknown store kind '{}'", other)),
        }
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// SQLite database path (defaults to `{base_dir}/store.db`).
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Shell command used by the command store, e.g. `sqlite3 /var/app.db`.
    #[serde(default)]
    pub command: Option<String>,

    /// Per-batch execution timeout (seconds).
    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            database: None,
            command: None,
            timeout_secs: default_store_timeout_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write a rolling log file under `{base_dir}/logs`.
    #[serde(default = "default_file_logging")]
    pub file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_file_logging(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".deferq"))
        .unwrap_or_else(|| PathBuf::from("/tmp/deferq"))
}

fn default_batch_size() -> usize {
    50
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_idle_exit_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_processing_timeout_secs() -> u64 {
    30
}

fn default_maintenance_every() -> u64 {
    50
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_health_cache_ttl_secs() -> u64 {
    5
}

fn default_startup_lock_timeout_secs() -> u64 {
    10
}

fn default_startup_wait_timeout_ms() -> u64 {
    2000
}

fn default_sequence_lock_timeout_ms() -> u64 {
    1000
}

fn default_event_read_timeout_secs() -> u64 {
    5
}

fn default_max_watcher_restarts() -> u32 {
    3
}

fn default_completed_retention_secs() -> u64 {
    3600
}

fn default_failed_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_store_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_file_logging() -> bool {
    true
}

impl Default for DeferqConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_exit_secs: default_idle_exit_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            processing_timeout_secs: default_processing_timeout_secs(),
            maintenance_every: default_maintenance_every(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            health_cache_ttl_secs: default_health_cache_ttl_secs(),
            startup_lock_timeout_secs: default_startup_lock_timeout_secs(),
            startup_wait_timeout_ms: default_startup_wait_timeout_ms(),
            sequence_lock_timeout_ms: default_sequence_lock_timeout_ms(),
            event_read_timeout_secs: default_event_read_timeout_secs(),
            max_watcher_restarts: default_max_watcher_restarts(),
            loop_strategy: LoopStrategyKind::default(),
            completed_retention_secs: default_completed_retention_secs(),
            failed_retention_secs: default_failed_retention_secs(),
            durable_writes: false,
            store: StoreConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl DeferqConfig {
    /// Default configuration rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` when idle exit is disabled.
    pub fn idle_exit(&self) -> Option<Duration> {
        (self.idle_exit_secs > 0).then(|| Duration::from_secs(self.idle_exit_secs))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn health_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.health_cache_ttl_secs)
    }

    pub fn startup_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_lock_timeout_secs)
    }

    pub fn startup_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_wait_timeout_ms)
    }

    pub fn sequence_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.sequence_lock_timeout_ms)
    }

    pub fn event_read_timeout(&self) -> Duration {
        Duration::from_secs(self.event_read_timeout_secs)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_secs)
    }

    /// SQLite database path, falling back to `{base_dir}/store.db`.
    pub fn store_database(&self) -> PathBuf {
        self.store
            .database
            .clone()
            .unwrap_or_else(|| self.base_dir.join("store.db"))
    }

    /// Directory for the rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
