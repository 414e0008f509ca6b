//! Loop strategies: how the worker waits for new work.
//!
//! Both strategies share the daemon's drain and maintenance routines; they
//! only differ in how the idle wait ends.

use std::time::Duration;

use async_trait::async_trait;
use deferq_daemon::SignalHandler;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::watcher::ChangeWatcher;

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Something changed under `pending/`.
    Changed,
    /// The wait timed out.
    Timeout,
    Shutdown,
}

#[async_trait]
pub trait LoopStrategy: Send {
    fn name(&self) -> &'static str;

    /// Block until work may be available, the timeout elapses or shutdown
    /// is requested.
    async fn wait(&mut self, signals: &SignalHandler) -> Wake;

    /// Called during maintenance. Returns `false` once the strategy can no
    /// longer work and the caller should fall back to polling.
    fn ensure_healthy(&mut self) -> bool {
        true
    }

    /// Whether a timeout in [`LoopStrategy::wait`] should trigger maintenance.
    fn maintains_on_timeout(&self) -> bool {
        false
    }
}

/// Sleep `poll_interval` between drains.
pub struct PollingStrategy {
    interval: Duration,
}

impl PollingStrategy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl LoopStrategy for PollingStrategy {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn wait(&mut self, signals: &SignalHandler) -> Wake {
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => Wake::Timeout,
            _ = signals.wait_for_shutdown() => Wake::Shutdown,
        }
    }
}

/// Block on watcher notifications with a read timeout.
pub struct EventStrategy {
    watcher: Box<dyn ChangeWatcher>,
    rx: mpsc::Receiver<()>,
    read_timeout: Duration,
    restarts: u32,
    max_restarts: u32,
}

impl EventStrategy {
    /// Start `watcher`. Fails if it cannot be started even once.
    pub fn start(
        mut watcher: Box<dyn ChangeWatcher>,
        read_timeout: Duration,
        max_restarts: u32,
    ) -> Result<Self, WorkerError> {
        let rx = watcher.start()?;
        Ok(Self {
            watcher,
            rx,
            read_timeout,
            restarts: 0,
            max_restarts,
        })
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

#[async_trait]
impl LoopStrategy for EventStrategy {
    fn name(&self) -> &'static str {
        "event"
    }

    async fn wait(&mut self, signals: &SignalHandler) -> Wake {
        let wake = tokio::select! {
            received = tokio::time::timeout(self.read_timeout, self.rx.recv()) => match received {
                Ok(Some(())) => Wake::Changed,
                // Sender gone: report a timeout so maintenance notices the dead watcher
                Ok(None) => Wake::Timeout,
                Err(_) => Wake::Timeout,
            },
            _ = signals.wait_for_shutdown() => Wake::Shutdown,
        };

        if wake == Wake::Changed {
            // Collapse a burst of notifications into one drain
            while self.rx.try_recv().is_ok() {}
        }
        wake
    }

    fn ensure_healthy(&mut self) -> bool {
        if self.watcher.is_alive() {
            return true;
        }

        while self.restarts < self.max_restarts {
            self.restarts += 1;
            warn!(
                attempt = self.restarts,
                max = self.max_restarts,
                "File watcher died, restarting"
            );
            match self.watcher.start() {
                Ok(rx) => {
                    self.rx = rx;
                    info!("File watcher restarted");
                    return true;
                }
                Err(e) => warn!("File watcher restart failed: {}", e),
            }
        }

        self.watcher.stop();
        warn!("File watcher restarts exhausted, falling back to polling");
        false
    }

    fn maintains_on_timeout(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Watcher driven by the test through shared handles. Starts beyond
    /// `fail_after` fail.
    #[derive(Clone)]
    struct FakeWatcher {
        alive: Arc<AtomicBool>,
        starts: Arc<AtomicU32>,
        fail_after: u32,
        tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    }

    impl FakeWatcher {
        fn new(fail_after: u32) -> Self {
            Self {
                alive: Arc::new(AtomicBool::new(false)),
                starts: Arc::new(AtomicU32::new(0)),
                fail_after,
                tx: Arc::new(Mutex::new(None)),
            }
        }

        fn sender(&self) -> mpsc::Sender<()> {
            self.tx.lock().clone().unwrap()
        }

        fn starts(&self) -> u32 {
            self.starts.load(Ordering::SeqCst)
        }
    }

    impl ChangeWatcher for FakeWatcher {
        fn start(&mut self) -> Result<mpsc::Receiver<()>, WorkerError> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.fail_after {
                return Err(WorkerError::Watcher("cannot start".to_string()));
            }
            let (tx, rx) = mpsc::channel(4);
            *self.tx.lock() = Some(tx);
            self.alive.store(true, Ordering::SeqCst);
            Ok(rx)
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn stop(&mut self) {
            *self.tx.lock() = None;
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_wait_times_out() {
        let mut strategy = PollingStrategy::new(Duration::from_millis(100));
        let signals = SignalHandler::new();
        assert_eq!(strategy.wait(&signals).await, Wake::Timeout);
        assert!(strategy.ensure_healthy());
        assert!(!strategy.maintains_on_timeout());
    }

    #[tokio::test]
    async fn test_wait_ends_on_shutdown() {
        let mut strategy = PollingStrategy::new(Duration::from_secs(60));
        let signals = SignalHandler::new();
        signals.request_shutdown();
        assert_eq!(strategy.wait(&signals).await, Wake::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_wait_times_out_without_events() {
        let watcher = FakeWatcher::new(u32::MAX);
        let mut strategy =
            EventStrategy::start(Box::new(watcher), Duration::from_secs(5), 3).unwrap();
        let signals = SignalHandler::new();
        assert_eq!(strategy.wait(&signals).await, Wake::Timeout);
        assert!(strategy.maintains_on_timeout());
    }

    #[tokio::test]
    async fn test_event_wait_wakes_on_change() {
        let watcher = FakeWatcher::new(u32::MAX);
        let mut strategy =
            EventStrategy::start(Box::new(watcher.clone()), Duration::from_secs(5), 3).unwrap();
        let signals = SignalHandler::new();

        let tx = watcher.sender();
        tx.send(()).await.unwrap();
        tx.send(()).await.unwrap();

        assert_eq!(strategy.wait(&signals).await, Wake::Changed);
        // The burst was collapsed into one wake-up
        assert!(strategy.rx.try_recv().is_err());
    }

    #[test]
    fn test_dead_watcher_is_restarted() {
        let watcher = FakeWatcher::new(u32::MAX);
        let mut strategy =
            EventStrategy::start(Box::new(watcher.clone()), Duration::from_secs(5), 3).unwrap();

        watcher.alive.store(false, Ordering::SeqCst);
        assert!(strategy.ensure_healthy());
        assert_eq!(strategy.restarts(), 1);
        assert_eq!(watcher.starts(), 2);
        assert!(watcher.is_alive());
    }

    #[test]
    fn test_restart_budget_exhaustion_requests_fallback() {
        // First start succeeds, every restart fails
        let watcher = FakeWatcher::new(1);
        let mut strategy =
            EventStrategy::start(Box::new(watcher.clone()), Duration::from_secs(5), 3).unwrap();

        watcher.alive.store(false, Ordering::SeqCst);
        assert!(!strategy.ensure_healthy());
        assert_eq!(strategy.restarts(), 3);
        assert_eq!(watcher.starts(), 4);
    }
}
