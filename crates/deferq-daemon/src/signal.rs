//! Signal handling for the worker process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::DaemonError;

/// Signal type for worker control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Graceful shutdown (SIGTERM, SIGINT).
    Shutdown,
    /// Force terminate (SIGKILL).
    Terminate,
}

impl std::fmt::Display for DaemonSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonSignal::Shutdown => write!(f, "SHUTDOWN"),
            DaemonSignal::Terminate => write!(f, "TERMINATE"),
        }
    }
}

/// Shutdown flag shared by the worker loop and the OS signal tasks.
///
/// The flag can be polled cheaply between entries; `wait_for_shutdown` lets
/// timed sleeps and channel reads be cancelled.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_requested: Arc<AtomicBool>,
    notifier: watch::Sender<bool>,
}

impl SignalHandler {
    /// Create a new signal handler.
    pub fn new() -> Self {
        let (notifier, _) = watch::channel(false);
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            notifier,
        }
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        debug!("Shutdown requested");
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.notifier.send_replace(true);
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// The underlying flag, for code that must not depend on tokio.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_requested)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.notifier.subscribe();
        // Err means the sender is gone, which cannot happen while `self` lives
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Set up OS signal handlers (Unix only).
    #[cfg(unix)]
    pub fn setup_os_signals(&self) -> Result<(), DaemonError> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
        let sigterm_handler = self.clone();
        tokio::spawn(async move {
            while sigterm.recv().await.is_some() {
                info!("Received SIGTERM");
                sigterm_handler.request_shutdown();
            }
        });

        let mut sigint =
            signal(SignalKind::interrupt()).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
        let sigint_handler = self.clone();
        tokio::spawn(async move {
            while sigint.recv().await.is_some() {
                info!("Received SIGINT");
                sigint_handler.request_shutdown();
            }
        });

        info!("OS signal handlers installed (SIGTERM, SIGINT)");
        Ok(())
    }

    /// Set up OS signal handlers (non-Unix fallback).
    #[cfg(not(unix))]
    pub fn setup_os_signals(&self) -> Result<(), DaemonError> {
        let handler = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received Ctrl+C");
                handler.request_shutdown();
            }
        });

        info!("OS signal handlers installed (Ctrl+C only)");
        Ok(())
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Send a signal to a running worker process.
#[cfg(unix)]
pub fn send_signal_to_pid(pid: u32, signal: DaemonSignal) -> Result<(), DaemonError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        DaemonSignal::Shutdown => Signal::SIGTERM,
        DaemonSignal::Terminate => Signal::SIGKILL,
    };

    kill(Pid::from_raw(pid as i32), nix_signal).map_err(|e| DaemonError::SignalDelivery {
        signal: signal.to_string(),
        pid,
        reason: e.to_string(),
    })?;

    info!("Sent {} to PID {}", signal, pid);
    Ok(())
}

#[cfg(not(unix))]
pub fn send_signal_to_pid(pid: u32, signal: DaemonSignal) -> Result<(), DaemonError> {
    Err(DaemonError::SignalDelivery {
        signal: signal.to_string(),
        pid,
        reason: "signal sending not supported on this platform".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_display() {
        assert_eq!(DaemonSignal::Shutdown.to_string(), "SHUTDOWN");
        assert_eq!(DaemonSignal::Terminate.to_string(), "TERMINATE");
    }

    #[test]
    fn test_signal_handler_new() {
        let handler = SignalHandler::new();
        assert!(!handler.is_shutdown_requested());
    }

    #[test]
    fn test_handler_clone_shares_state() {
        let handler = SignalHandler::new();
        let cloned = handler.clone();

        handler.request_shutdown();
        assert!(cloned.is_shutdown_requested());
        assert!(cloned.flag().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_wakes_up() {
        let handler = SignalHandler::new();
        let waiter = handler.clone();
        let task = tokio::spawn(async move { waiter.wait_for_shutdown().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handler.request_shutdown();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter did not wake up")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_request_returns_immediately() {
        let handler = SignalHandler::new();
        handler.request_shutdown();
        tokio::time::timeout(Duration::from_millis(100), handler.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn test_send_signal_to_missing_pid() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let err = send_signal_to_pid(pid, DaemonSignal::Shutdown).unwrap_err();
        assert!(matches!(err, DaemonError::SignalDelivery { .. }));
    }
}
