//! Daemon-related errors.

use std::path::PathBuf;

use deferq_queue::QueueError;
use thiserror::Error;

/// Errors that can occur during worker coordination.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Another live process holds the worker lease.
    #[error("Worker already running (lease: {path}, PID: {pid})")]
    AlreadyRunning { path: PathBuf, pid: u32 },

    /// Failed to create the lease file.
    #[error("Failed to create lease at {path}: {reason}")]
    LeaseCreation { path: PathBuf, reason: String },

    /// Failed to remove the lease file.
    #[error("Failed to remove lease at {path}: {reason}")]
    LeaseRemoval { path: PathBuf, reason: String },

    /// Failed to create or reclaim the startup lock.
    #[error("Startup lock error at {path}: {reason}")]
    StartupLock { path: PathBuf, reason: String },

    /// Worker process could not be launched.
    #[error("Failed to launch worker: {0}")]
    LaunchFailed(String),

    /// Failed to set up signal handlers.
    #[error("Failed to set up signal handlers: {0}")]
    SignalSetup(String),

    /// Failed to deliver a signal.
    #[error("Failed to send {signal} to PID {pid}: {reason}")]
    SignalDelivery {
        signal: String,
        pid: u32,
        reason: String,
    },

    /// No worker is running.
    #[error("Worker is not running")]
    NotRunning,

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_error() {
        let err = DaemonError::AlreadyRunning {
            path: PathBuf::from("/tmp/worker.lease"),
            pid: 12345,
        };
        let msg = err.to_string();
        assert!(msg.contains("already running"));
        assert!(msg.contains("12345"));
    }

    #[test]
    fn test_signal_delivery_error() {
        let err = DaemonError::SignalDelivery {
            signal: "TERMINATE".to_string(),
            pid: 42,
            reason: "ESRCH".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("TERMINATE"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let daemon_err: DaemonError = io_err.into();
        assert!(daemon_err.to_string().contains("file not found"));
    }
}
