//! The worker daemon: lease, recovery, main loop, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use deferq_config::{DeferqConfig, LoopStrategyKind};
use deferq_daemon::{
    HealthCache, HeartbeatSnapshot, HeartbeatWriter, LeaseStatus, SignalHandler, WorkerLease,
};
use deferq_queue::{Partition, QueueStore, RetentionPolicy};
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::StoreClient;
use crate::drain::{BatchDrainer, DrainReport};
use crate::error::WorkerError;
use crate::retry::RetryConfig;
use crate::strategy::{EventStrategy, LoopStrategy, PollingStrategy, Wake};
use crate::watcher::{ChangeWatcher, NotifyWatcher};

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;

/// Entries settled on shutdown before the rest is left to orphan recovery.
pub const SHUTDOWN_DRAIN_LIMIT: usize = 100;

/// Floor for the in-drain heartbeat ticker.
const MIN_BEAT_PERIOD: Duration = Duration::from_millis(100);

/// Why the worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Termination signal.
    Shutdown,
    /// No work for `idle_exit`.
    Idle,
    /// Run-once mode found `pending/` empty.
    Drained,
    /// Another process took over the lease.
    LeaseLost,
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Shutdown => write!(f, "shutdown"),
            WorkerExit::Idle => write!(f, "idle"),
            WorkerExit::Drained => write!(f, "drained"),
            WorkerExit::LeaseLost => write!(f, "lease lost"),
        }
    }
}

/// Single-instance queue worker.
pub struct WorkerDaemon {
    config: DeferqConfig,
    store: QueueStore,
    client: Arc<dyn StoreClient>,
    signals: SignalHandler,
    /// Taken when the loop starts; behind a mutex so the daemon stays `Sync`.
    watcher: Mutex<Option<Box<dyn ChangeWatcher>>>,
    run_once: bool,
}

impl WorkerDaemon {
    pub fn new(
        config: DeferqConfig,
        store: QueueStore,
        client: Arc<dyn StoreClient>,
        signals: SignalHandler,
    ) -> Self {
        Self {
            config,
            store,
            client,
            signals,
            watcher: Mutex::new(None),
            run_once: false,
        }
    }

    /// Use `watcher` instead of a native watcher on `pending/`.
    pub fn with_watcher(mut self, watcher: Box<dyn ChangeWatcher>) -> Self {
        self.watcher = Mutex::new(Some(watcher));
        self
    }

    /// Exit as soon as `pending/` is empty.
    pub fn run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    pub fn signals(&self) -> &SignalHandler {
        &self.signals
    }

    /// Run until shutdown, idle exit, lease loss or (in run-once mode) an
    /// empty queue.
    ///
    /// Fails only at startup: when another live worker holds the lease or the
    /// queue directories cannot be created.
    pub async fn run(self) -> Result<WorkerExit, WorkerError> {
        let layout = self.store.layout().clone();
        layout.ensure()?;

        let mut lease = WorkerLease::new(layout.lease_file());
        let record = lease.try_acquire()?;
        info!(
            pid = record.pid,
            base_dir = %layout.base().display(),
            store = self.client.id(),
            "Worker started"
        );

        // Anything in-flight now belongs to a dead predecessor
        if let Err(e) = self.store.recover_orphans(Duration::ZERO, self.config.max_retries) {
            warn!("Startup orphan recovery failed: {}", e);
        }

        let mut heartbeat =
            HeartbeatWriter::new(layout.heartbeat_file(), self.config.heartbeat_interval());
        if let Err(e) = heartbeat.force(self.snapshot(0)) {
            warn!("Failed to write initial heartbeat: {}", e);
        }

        let drainer = BatchDrainer::new(
            self.store.clone(),
            Arc::clone(&self.client),
            RetryConfig::from_config(&self.config),
            self.config.batch_size,
            self.config.max_retries,
            self.signals.clone(),
        );
        let mut strategy = self.select_strategy();
        info!(strategy = strategy.name(), run_once = self.run_once, "Entering main loop");

        let (exit, totals) = self
            .main_loop(&drainer, &mut strategy, &lease, &mut heartbeat)
            .await;

        let settled = drainer.finish_held(SHUTDOWN_DRAIN_LIMIT).await;
        if settled.completed + settled.failed + settled.requeued > 0 {
            info!(
                completed = settled.completed,
                failed = settled.failed,
                requeued = settled.requeued,
                "Settled held entries"
            );
        }

        if exit != WorkerExit::LeaseLost {
            heartbeat.remove();
            HealthCache::new(layout.health_cache_file(), self.config.health_cache_ttl())
                .invalidate();
        }
        if let Err(e) = lease.release() {
            warn!("Failed to release lease: {}", e);
        }

        info!(
            reason = %exit,
            completed = totals.completed + settled.completed,
            failed = totals.failed + settled.failed,
            requeued = totals.requeued + settled.requeued,
            "Worker stopped"
        );
        Ok(exit)
    }

    fn select_strategy(&self) -> Box<dyn LoopStrategy> {
        let polling: Box<dyn LoopStrategy> =
            Box::new(PollingStrategy::new(self.config.poll_interval()));
        if self.config.loop_strategy == LoopStrategyKind::Polling {
            return polling;
        }

        let watcher = self
            .watcher
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(NotifyWatcher::new(self.store.layout().pending())));
        match EventStrategy::start(
            watcher,
            self.config.event_read_timeout(),
            self.config.max_watcher_restarts,
        ) {
            Ok(strategy) => Box::new(strategy),
            Err(e) => {
                warn!("Event-driven loop unavailable, polling instead: {}", e);
                polling
            }
        }
    }

    async fn main_loop(
        &self,
        drainer: &BatchDrainer,
        strategy: &mut Box<dyn LoopStrategy>,
        lease: &WorkerLease,
        heartbeat: &mut HeartbeatWriter,
    ) -> (WorkerExit, DrainReport) {
        let maintenance_every = self.config.maintenance_every.max(1);
        let idle_exit = self.config.idle_exit();
        let mut totals = DrainReport::default();
        let mut iteration: u64 = 0;
        let mut last_activity = Instant::now();

        loop {
            if self.signals.is_shutdown_requested() {
                return (WorkerExit::Shutdown, totals);
            }
            iteration += 1;

            let report = match self.drain_beating(drainer, heartbeat, iteration).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Drain pass failed: {}", e);
                    DrainReport::default()
                }
            };
            if report.claimed > 0 {
                last_activity = Instant::now();
                totals.merge(report);
            }

            if iteration % maintenance_every == 0 {
                if let Some(exit) = self.maintain(strategy, lease) {
                    return (exit, totals);
                }
            }
            self.beat(heartbeat, iteration);

            // Keep draining while entries keep coming
            if report.claimed > 0 {
                continue;
            }
            if self.run_once {
                return (WorkerExit::Drained, totals);
            }
            if let Some(idle) = idle_exit {
                if last_activity.elapsed() >= idle {
                    info!(idle_secs = idle.as_secs(), "No work, exiting");
                    return (WorkerExit::Idle, totals);
                }
            }

            match strategy.wait(&self.signals).await {
                Wake::Shutdown => return (WorkerExit::Shutdown, totals),
                Wake::Changed => {}
                Wake::Timeout if strategy.maintains_on_timeout() => {
                    if let Some(exit) = self.maintain(strategy, lease) {
                        return (exit, totals);
                    }
                }
                Wake::Timeout => {}
            }
        }
    }

    /// Orphan recovery, retention cleanup, lease verification and watcher
    /// liveness. Returns an exit reason when the worker must stop.
    fn maintain(
        &self,
        strategy: &mut Box<dyn LoopStrategy>,
        lease: &WorkerLease,
    ) -> Option<WorkerExit> {
        if let LeaseStatus::Lost { holder } = lease.verify() {
            warn!(holder = ?holder, "Lease taken over, stopping");
            return Some(WorkerExit::LeaseLost);
        }

        if let Err(e) = self
            .store
            .recover_orphans(self.config.processing_timeout(), self.config.max_retries)
        {
            warn!("Orphan recovery failed: {}", e);
        }

        let cleaned = self.store.cleanup(&RetentionPolicy::from_config(&self.config));
        if cleaned.total() > 0 {
            debug!(
                completed = cleaned.completed,
                failed = cleaned.failed,
                staging = cleaned.staging,
                "Janitor removed expired entries"
            );
        }

        if !strategy.ensure_healthy() {
            *strategy = Box::new(PollingStrategy::new(self.config.poll_interval()));
            info!("Switched to polling loop");
        }
        None
    }

    /// One drain pass. A pass can wait on the store for several timeouts, so
    /// the heartbeat keeps ticking until it returns.
    async fn drain_beating(
        &self,
        drainer: &BatchDrainer,
        heartbeat: &mut HeartbeatWriter,
        iteration: u64,
    ) -> Result<DrainReport, WorkerError> {
        let period = self.config.heartbeat_interval().max(MIN_BEAT_PERIOD);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let drain = drainer.drain_once();
        tokio::pin!(drain);
        loop {
            tokio::select! {
                report = &mut drain => return report,
                _ = ticker.tick() => self.write_heartbeat(heartbeat, iteration),
            }
        }
    }

    fn beat(&self, heartbeat: &mut HeartbeatWriter, iteration: u64) {
        if heartbeat.is_due() {
            self.write_heartbeat(heartbeat, iteration);
        }
    }

    fn write_heartbeat(&self, heartbeat: &mut HeartbeatWriter, iteration: u64) {
        if let Err(e) = heartbeat.force(self.snapshot(iteration)) {
            warn!("Failed to write heartbeat: {}", e);
        }
    }

    fn snapshot(&self, iteration: u64) -> HeartbeatSnapshot {
        HeartbeatSnapshot {
            queue_depth: self.store.depth(Partition::Pending),
            in_flight: self.store.depth(Partition::InFlight),
            iteration,
        }
    }
}
