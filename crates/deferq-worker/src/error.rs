//! Worker errors.

use deferq_config::ConfigError;
use deferq_daemon::DaemonError;
use deferq_queue::{QueueError, Rejected};
use thiserror::Error;

/// Outcome of a failed `execute_batch`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Busy, locked or timed out; the same batch may succeed later.
    #[error("Store temporarily unavailable: {0}")]
    Transient(String),

    /// The store rejected the batch itself.
    #[error("Store rejected batch: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StoreError::Transient(m) | StoreError::Permanent(m) => m,
        }
    }
}

/// Errors that stop the worker or a direct execution.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rejected(#[from] Rejected),

    /// Store client could not be opened.
    #[error("Failed to open store: {0}")]
    StoreOpen(String),

    /// Filesystem watcher could not be started.
    #[error("File watcher error: {0}")]
    Watcher(String),
}

impl WorkerError {
    /// Another worker holds the lease.
    pub fn is_already_running(&self) -> bool {
        matches!(self, WorkerError::Daemon(DaemonError::AlreadyRunning { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Transient("database is locked".into()).is_transient());
        assert!(!StoreError::Permanent("no such table".into()).is_transient());
        assert_eq!(StoreError::Permanent("no such table".into()).message(), "no such table");
    }

    #[test]
    fn test_already_running_is_detected() {
        let err = WorkerError::from(DaemonError::AlreadyRunning {
            path: PathBuf::from("/tmp/worker.lease"),
            pid: 42,
        });
        assert!(err.is_already_running());
        assert!(err.to_string().contains("42"));
        assert!(!WorkerError::Watcher("gone".into()).is_already_running());
    }
}
