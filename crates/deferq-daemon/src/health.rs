//! Worker health checks.
//!
//! The fast path reads a short-lived cache file and never touches the process
//! table. The full check inspects lease, holder liveness and heartbeat age,
//! and repairs what it finds: a dead holder's lease is cleared, a live but
//! silent holder is killed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use deferq_config::DeferqConfig;
use deferq_queue::QueueLayout;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::heartbeat::{Heartbeat, write_atomic};
use crate::lease::{LeaseRecord, WorkerLease};
use crate::process::is_process_running;
use crate::signal::{DaemonSignal, send_signal_to_pid};

/// Why the worker was judged unhealthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnhealthyReason {
    /// No lease on disk.
    NoLease,
    /// The lease holder is gone; lease and heartbeat were cleared.
    DeadHolder { pid: u32 },
    /// The holder is alive but its heartbeat is stale; it was terminated.
    Stuck { pid: u32, silent_for: Duration },
}

impl std::fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnhealthyReason::NoLease => write!(f, "no worker lease"),
            UnhealthyReason::DeadHolder { pid } => write!(f, "lease holder {} is not running", pid),
            UnhealthyReason::Stuck { pid, silent_for } => {
                write!(f, "worker {} silent for {}s", pid, silent_for.as_secs())
            }
        }
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthReport {
    Healthy { pid: Option<u32>, cached: bool },
    Unhealthy(UnhealthyReason),
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthReport::Healthy { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    checked_at: DateTime<Utc>,
    pid: u32,
}

/// Memo of "the worker was healthy at time T".
#[derive(Debug, Clone)]
pub struct HealthCache {
    path: PathBuf,
    ttl: Duration,
}

impl HealthCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
        }
    }

    /// Holder PID when a positive entry younger than the TTL exists.
    pub fn fresh(&self) -> Option<u32> {
        let bytes = fs::read(&self.path).ok()?;
        let record: CacheRecord = serde_json::from_slice(&bytes).ok()?;
        let age = (Utc::now() - record.checked_at).to_std().ok()?;
        (age < self.ttl).then_some(record.pid)
    }

    pub fn record(&self, pid: u32) {
        let record = CacheRecord {
            checked_at: Utc::now(),
            pid,
        };
        let result = serde_json::to_vec(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .and_then(|bytes| write_atomic(&self.path, &bytes));
        if let Err(e) = result {
            debug!("Failed to write health cache: {}", e);
        }
    }

    pub fn invalidate(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Full and cached worker health checks.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    lease_path: PathBuf,
    heartbeat_path: PathBuf,
    cache: HealthCache,
    heartbeat_timeout: Duration,
}

impl HealthChecker {
    pub fn new(layout: &QueueLayout, heartbeat_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            lease_path: layout.lease_file(),
            heartbeat_path: layout.heartbeat_file(),
            cache: HealthCache::new(layout.health_cache_file(), cache_ttl),
            heartbeat_timeout,
        }
    }

    pub fn from_config(config: &DeferqConfig) -> Self {
        Self::new(
            &QueueLayout::new(config.base_dir.clone()),
            config.heartbeat_timeout(),
            config.health_cache_ttl(),
        )
    }

    pub fn lease_path(&self) -> &Path {
        &self.lease_path
    }

    pub fn cache(&self) -> &HealthCache {
        &self.cache
    }

    /// Fast path first, full check on a cache miss.
    pub fn check(&self) -> HealthReport {
        if let Some(pid) = self.cache.fresh() {
            return HealthReport::Healthy {
                pid: Some(pid),
                cached: true,
            };
        }
        self.full_check()
    }

    /// Inspect lease, holder and heartbeat, repairing stale state.
    pub fn full_check(&self) -> HealthReport {
        let lease = WorkerLease::new(&self.lease_path);
        let Some(record) = lease.holder() else {
            self.cache.invalidate();
            return HealthReport::Unhealthy(UnhealthyReason::NoLease);
        };
        let pid = record.pid;

        if !is_process_running(pid) {
            info!(pid, "Worker lease holder is gone, clearing lease");
            self.clear_worker_state();
            return HealthReport::Unhealthy(UnhealthyReason::DeadHolder { pid });
        }

        let silent_for = self.silence(&record);
        if silent_for > self.heartbeat_timeout {
            warn!(
                pid,
                silent_secs = silent_for.as_secs(),
                "Worker heartbeat is stale, terminating"
            );
            self.terminate(pid);
            self.clear_worker_state();
            return HealthReport::Unhealthy(UnhealthyReason::Stuck { pid, silent_for });
        }

        self.cache.record(pid);
        HealthReport::Healthy {
            pid: Some(pid),
            cached: false,
        }
    }

    /// Time since the holder last showed life. A worker that has not written
    /// its first heartbeat yet is measured from lease acquisition.
    fn silence(&self, lease: &LeaseRecord) -> Duration {
        match Heartbeat::read(&self.heartbeat_path) {
            Some(heartbeat) if heartbeat.pid == lease.pid => heartbeat.age(),
            _ => (Utc::now() - lease.acquired_at).to_std().unwrap_or(Duration::ZERO),
        }
    }

    fn terminate(&self, pid: u32) {
        if pid == std::process::id() {
            warn!(pid, "Refusing to terminate the current process");
            return;
        }
        if let Err(e) = send_signal_to_pid(pid, DaemonSignal::Terminate) {
            warn!(pid, "Failed to terminate stuck worker: {}", e);
        }
    }

    fn clear_worker_state(&self) {
        self.cache.invalidate();
        if let Err(e) = WorkerLease::force_remove(&self.lease_path) {
            warn!("{}", e);
        }
        Heartbeat::clear(&self.heartbeat_path);
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
