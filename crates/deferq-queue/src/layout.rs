//! Base directory layout.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::QueueError;

/// A named queue partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Pending,
    InFlight,
    Completed,
    Failed,
    Quarantine,
}

impl Partition {
    pub const ALL: [Partition; 5] = [
        Partition::Pending,
        Partition::InFlight,
        Partition::Completed,
        Partition::Failed,
        Partition::Quarantine,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Partition::Pending => "pending",
            Partition::InFlight => "in-flight",
            Partition::Completed => "completed",
            Partition::Failed => "failed",
            Partition::Quarantine => "quarantine",
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Paths of every file and directory under the base directory.
#[derive(Debug, Clone)]
pub struct QueueLayout {
    base: PathBuf,
}

impl QueueLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn partition(&self, partition: Partition) -> PathBuf {
        self.base.join(partition.dir_name())
    }

    pub fn pending(&self) -> PathBuf {
        self.partition(Partition::Pending)
    }

    pub fn in_flight(&self) -> PathBuf {
        self.partition(Partition::InFlight)
    }

    /// Scratch area for staging files.
    pub fn tmp(&self) -> PathBuf {
        self.base.join("tmp")
    }

    pub fn counters(&self) -> PathBuf {
        self.base.join("counters")
    }

    pub fn sequence_file(&self) -> PathBuf {
        self.base.join("sequence.counter")
    }

    pub fn lease_file(&self) -> PathBuf {
        self.base.join("worker.lease")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.base.join("heartbeat.json")
    }

    pub fn health_cache_file(&self) -> PathBuf {
        self.base.join("health.cache")
    }

    pub fn startup_lock_dir(&self) -> PathBuf {
        self.base.join("startup.lock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Create every directory of the layout.
    pub fn ensure(&self) -> Result<(), QueueError> {
        let mut dirs: Vec<PathBuf> = Partition::ALL.iter().map(|p| self.partition(*p)).collect();
        dirs.push(self.tmp());
        dirs.push(self.counters());

        for dir in dirs {
            fs::create_dir_all(&dir)
                .map_err(|e| QueueError::unavailable(format!("create {}", dir.display()), e))?;
        }
        Ok(())
    }
}
