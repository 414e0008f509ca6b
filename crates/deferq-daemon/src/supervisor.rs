//! Supervisor: keep exactly one healthy worker running.
//!
//! [`Supervisor::ensure_worker_running`] is the hot path called after every
//! enqueue. It only reads files and, when the worker is unhealthy, hands the
//! actual start to a [`StartDispatch`] so the caller never waits on a launch.
//!
//! [`StartCoordinator::start_if_needed`] is the blocking start: it serializes
//! competing starters through the startup lock, re-checks health while
//! holding it, launches a detached worker and waits for its lease.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use deferq_config::DeferqConfig;
use deferq_queue::{EnqueueNotifier, QueueLayout};
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::health::{HealthChecker, HealthReport};
use crate::lease::WorkerLease;
use crate::process::is_process_running;
use crate::startup_lock::StartupLock;

const LOCK_BACKOFF: Duration = Duration::from_millis(50);
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Starts a worker process.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<(), DaemonError>;
}

/// Launches `program args…` fully detached from the caller.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-invoke the running executable with `args`.
    pub fn current_exe(args: &[&str]) -> Result<Self, DaemonError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, args.iter().map(OsString::from).collect()))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> Result<(), DaemonError> {
        let pid = spawn_detached(&self.program, &self.args)?;
        info!(pid, program = %self.program.display(), "Worker launched");
        Ok(())
    }
}

/// Spawn with null stdio in a new process group, reaping it in the background.
fn spawn_detached(program: &Path, args: &[OsString]) -> Result<u32, DaemonError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| DaemonError::LaunchFailed(format!("{}: {}", program.display(), e)))?;
    let pid = child.id();

    let reaper = thread::Builder::new()
        .name("deferq-reaper".to_string())
        .spawn(move || {
            let _ = child.wait();
        });
    if let Err(e) = reaper {
        debug!(pid, "Could not spawn reaper thread: {}", e);
    }
    Ok(pid)
}

/// Result of a blocking start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A healthy worker was found; nothing was launched.
    AlreadyHealthy,
    /// A worker was launched and its lease observed.
    Launched { pid: u32 },
    /// A worker was launched but no live lease appeared in time.
    LaunchTimedOut,
    /// Another starter kept the lock for the whole attempt.
    LockBusy,
}

pub struct StartCoordinator {
    checker: HealthChecker,
    startup_lock: StartupLock,
    launcher: Arc<dyn Launcher>,
    wait_timeout: Duration,
}

impl StartCoordinator {
    pub fn new(
        checker: HealthChecker,
        startup_lock: StartupLock,
        launcher: Arc<dyn Launcher>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            checker,
            startup_lock,
            launcher,
            wait_timeout,
        }
    }

    pub fn from_config(config: &DeferqConfig, launcher: Arc<dyn Launcher>) -> Self {
        let layout = QueueLayout::new(config.base_dir.clone());
        Self::new(
            HealthChecker::from_config(config),
            StartupLock::new(layout.startup_lock_dir(), config.startup_lock_timeout()),
            launcher,
            config.startup_wait_timeout(),
        )
    }

    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    pub fn startup_lock(&self) -> &StartupLock {
        &self.startup_lock
    }

    /// Launch a worker unless a healthy one exists. Blocks for at most the
    /// startup lock timeout plus the startup wait timeout.
    pub fn start_if_needed(&self) -> Result<StartOutcome, DaemonError> {
        let deadline = Instant::now() + self.startup_lock.timeout() + self.wait_timeout;

        loop {
            if self.checker.check().is_healthy() {
                return Ok(StartOutcome::AlreadyHealthy);
            }

            let Some(guard) = self.startup_lock.try_acquire()? else {
                if Instant::now() >= deadline {
                    warn!("Gave up waiting for the startup lock");
                    return Ok(StartOutcome::LockBusy);
                }
                thread::sleep(LOCK_BACKOFF);
                continue;
            };

            // Another starter may have finished between our check and the lock
            if let HealthReport::Healthy { .. } = self.checker.full_check() {
                return Ok(StartOutcome::AlreadyHealthy);
            }

            self.launcher.launch()?;
            let outcome = match self.wait_for_worker() {
                Some(pid) => {
                    info!(pid, "Worker is up");
                    StartOutcome::Launched { pid }
                }
                None => {
                    warn!(
                        timeout_ms = self.wait_timeout.as_millis() as u64,
                        "Worker did not take the lease in time"
                    );
                    StartOutcome::LaunchTimedOut
                }
            };
            drop(guard);
            return Ok(outcome);
        }
    }

    fn wait_for_worker(&self) -> Option<u32> {
        let lease = WorkerLease::new(self.checker.lease_path());
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if let Some(record) = lease.holder() {
                if is_process_running(record.pid) {
                    return Some(record.pid);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(LEASE_POLL_INTERVAL);
        }
    }
}

/// Runs a start attempt off the caller's path.
pub trait StartDispatch: Send + Sync {
    fn dispatch(&self) -> Result<(), DaemonError>;
}

/// Runs [`StartCoordinator::start_if_needed`] on a background thread.
/// Suits long-lived host processes.
pub struct ThreadDispatch {
    coordinator: Arc<StartCoordinator>,
    running: Arc<AtomicBool>,
}

impl ThreadDispatch {
    pub fn new(coordinator: Arc<StartCoordinator>) -> Self {
        Self {
            coordinator,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl StartDispatch for ThreadDispatch {
    fn dispatch(&self) -> Result<(), DaemonError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let coordinator = Arc::clone(&self.coordinator);
        let running = Arc::clone(&self.running);
        let spawned = thread::Builder::new()
            .name("deferq-start".to_string())
            .spawn(move || {
                match coordinator.start_if_needed() {
                    Ok(outcome) => debug!(?outcome, "Background start finished"),
                    Err(e) => warn!("Background start failed: {}", e),
                }
                running.store(false, Ordering::SeqCst);
            });

        spawned.map(|_| ()).map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            DaemonError::LaunchFailed(e.to_string())
        })
    }
}

/// Spawns a detached helper process that performs the start.
/// Suits short-lived callers such as CLI invocations.
pub struct HelperDispatch {
    program: PathBuf,
    args: Vec<OsString>,
}

impl HelperDispatch {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl StartDispatch for HelperDispatch {
    fn dispatch(&self) -> Result<(), DaemonError> {
        let pid = spawn_detached(&self.program, &self.args)?;
        debug!(pid, "Start helper spawned");
        Ok(())
    }
}

/// Result of [`Supervisor::ensure_worker_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Healthy,
    /// Another process is inside the startup window.
    StartPending,
    StartDispatched,
    DispatchFailed,
}

pub struct Supervisor {
    checker: HealthChecker,
    startup_lock: StartupLock,
    dispatch: Box<dyn StartDispatch>,
}

impl Supervisor {
    pub fn new(
        checker: HealthChecker,
        startup_lock: StartupLock,
        dispatch: Box<dyn StartDispatch>,
    ) -> Self {
        Self {
            checker,
            startup_lock,
            dispatch,
        }
    }

    pub fn from_config(config: &DeferqConfig, dispatch: Box<dyn StartDispatch>) -> Self {
        let layout = QueueLayout::new(config.base_dir.clone());
        Self::new(
            HealthChecker::from_config(config),
            StartupLock::new(layout.startup_lock_dir(), config.startup_lock_timeout()),
            dispatch,
        )
    }

    /// Make sure a worker is running without ever blocking on a start.
    pub fn ensure_worker_running(&self) -> EnsureOutcome {
        let reason = match self.checker.check() {
            HealthReport::Healthy { .. } => return EnsureOutcome::Healthy,
            HealthReport::Unhealthy(reason) => reason,
        };

        if self.startup_lock.is_held() {
            return EnsureOutcome::StartPending;
        }

        debug!(%reason, "Worker unhealthy, dispatching start");
        match self.dispatch.dispatch() {
            Ok(()) => EnsureOutcome::StartDispatched,
            Err(e) => {
                warn!("Failed to dispatch worker start: {}", e);
                EnsureOutcome::DispatchFailed
            }
        }
    }
}

impl EnqueueNotifier for Supervisor {
    fn notify(&self) {
        self.ensure_worker_running();
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
