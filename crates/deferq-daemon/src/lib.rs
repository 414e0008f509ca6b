//! # deferq daemon
//!
//! Process coordination for the deferq worker.
//!
//! ## Features
//!
//! - Worker lease (single active worker, stale reclaim)
//! - Heartbeat records written by the worker
//! - Health cache and full health check with stuck-worker termination
//! - Startup lock guarding the launch window
//! - Supervisor: `ensure_worker_running()` fast path and detached starts
//! - Signal handling (SIGTERM/SIGINT for graceful shutdown)

pub mod error;
pub mod health;
pub mod heartbeat;
pub mod lease;
pub mod process;
pub mod signal;
pub mod startup_lock;
pub mod status;
pub mod supervisor;

pub use error::DaemonError;
pub use health::{HealthCache, HealthChecker, HealthReport, UnhealthyReason};
pub use heartbeat::{Heartbeat, HeartbeatSnapshot, HeartbeatWriter};
pub use lease::{LeaseRecord, LeaseStatus, WorkerLease};
pub use process::is_process_running;
pub use signal::{DaemonSignal, SignalHandler, send_signal_to_pid};
pub use startup_lock::{StartupLock, StartupLockGuard};
pub use status::{StatusReport, WorkerStatus};
pub use supervisor::{
    EnsureOutcome, HelperDispatch, Launcher, ProcessLauncher, StartCoordinator, StartDispatch,
    StartOutcome, Supervisor, ThreadDispatch,
};
