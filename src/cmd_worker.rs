//! Worker subcommand handlers for deferq.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use deferq_config::DeferqConfig;
use deferq_daemon::process::wait_for_exit;
use deferq_daemon::{
    DaemonSignal, HealthCache, Heartbeat, ProcessLauncher, SignalHandler, StartCoordinator,
    StartOutcome, WorkerLease, is_process_running, send_signal_to_pid,
};
use deferq_queue::{QueueLayout, QueueStore};
use deferq_worker::{WorkerDaemon, open_store};

use crate::cli::WorkerAction;

/// How long `worker stop` waits for a graceful exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `worker stop --force` waits after SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle worker subcommands.
pub(crate) async fn handle_worker_command(
    action: WorkerAction,
    config: DeferqConfig,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        WorkerAction::Start => worker_start(config, config_path).await,
        WorkerAction::Run { once } => worker_run(config, once).await,
        WorkerAction::Stop { force } => worker_stop(config, force).await,
    }
}

/// Arguments that re-invoke this executable with the same configuration.
pub(crate) fn self_args(config_path: Option<&Path>, args: &[&str]) -> Vec<OsString> {
    let mut out: Vec<OsString> = args.iter().map(OsString::from).collect();
    if let Some(path) = config_path {
        // Detached children may not share our working directory
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        out.push(OsString::from("--config"));
        out.push(path.into_os_string());
    }
    out
}

/// Launcher that starts `deferq worker run` detached.
pub(crate) fn worker_launcher(
    config_path: Option<&Path>,
) -> Result<ProcessLauncher, Box<dyn std::error::Error>> {
    let program = std::env::current_exe()?;
    Ok(ProcessLauncher::new(program, self_args(config_path, &["worker", "run"])))
}

/// Run a blocking start attempt off the async runtime.
pub(crate) async fn start_worker(
    config: &DeferqConfig,
    config_path: Option<&Path>,
) -> Result<StartOutcome, Box<dyn std::error::Error>> {
    let launcher = Arc::new(worker_launcher(config_path)?);
    let coordinator = StartCoordinator::from_config(config, launcher);
    let outcome = tokio::task::spawn_blocking(move || coordinator.start_if_needed()).await??;
    Ok(outcome)
}

/// Start a detached worker.
async fn worker_start(
    config: DeferqConfig,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting worker...");
    match start_worker(&config, config_path).await? {
        StartOutcome::AlreadyHealthy => println!("Worker is already running"),
        StartOutcome::Launched { pid } => println!("Worker started (PID: {})", pid),
        StartOutcome::LaunchTimedOut => {
            error!("Worker did not take the lease in time");
            return Err("worker did not start in time".into());
        }
        StartOutcome::LockBusy => println!("Another process is starting the worker"),
    }
    Ok(())
}

/// Run the worker in the foreground until it exits.
async fn worker_run(config: DeferqConfig, once: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting deferq worker v{}", env!("CARGO_PKG_VERSION"));

    let signals = SignalHandler::new();
    signals.setup_os_signals()?;

    let store = QueueStore::from_config(&config)?;
    let client = open_store(&config).await?;

    match WorkerDaemon::new(config, store, client, signals)
        .run_once(once)
        .run()
        .await
    {
        Ok(exit) => {
            info!(reason = %exit, "Worker exited");
            Ok(())
        }
        Err(e) if e.is_already_running() => {
            error!("Another worker holds the lease: {}", e);
            Err(Box::new(e))
        }
        Err(e) => {
            error!("Worker failed: {}", e);
            Err(Box::new(e))
        }
    }
}

/// Stop the worker holding the lease.
async fn worker_stop(config: DeferqConfig, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let layout = QueueLayout::new(config.base_dir.clone());
    let lease_path = layout.lease_file();

    let Some(holder) = WorkerLease::new(&lease_path).holder() else {
        println!("Worker is not running");
        return Ok(());
    };
    let pid = holder.pid;

    if !is_process_running(pid) {
        warn!(pid, "Lease holder is gone, removing stale lease");
        clear_worker_state(&config, &layout)?;
        println!("Worker is not running (removed stale lease of PID {})", pid);
        return Ok(());
    }

    info!("Stopping worker (PID: {})...", pid);
    send_signal_to_pid(pid, DaemonSignal::Shutdown)?;
    if tokio::task::spawn_blocking(move || wait_for_exit(pid, STOP_TIMEOUT)).await? {
        println!("Worker stopped");
        return Ok(());
    }

    if !force {
        warn!("Worker did not stop gracefully, try --force");
        return Err(format!(
            "worker (PID: {}) did not stop within {}s",
            pid,
            STOP_TIMEOUT.as_secs()
        )
        .into());
    }

    warn!(pid, "Killing worker");
    send_signal_to_pid(pid, DaemonSignal::Terminate)?;
    if !tokio::task::spawn_blocking(move || wait_for_exit(pid, KILL_TIMEOUT)).await? {
        error!("Worker did not die after SIGKILL");
        return Err(format!("failed to kill worker (PID: {})", pid).into());
    }

    // A killed worker leaves its lease and heartbeat behind
    clear_worker_state(&config, &layout)?;
    println!("Worker killed");
    Ok(())
}

fn clear_worker_state(
    config: &DeferqConfig,
    layout: &QueueLayout,
) -> Result<(), Box<dyn std::error::Error>> {
    WorkerLease::force_remove(&layout.lease_file())?;
    Heartbeat::clear(&layout.heartbeat_file());
    HealthCache::new(layout.health_cache_file(), config.health_cache_ttl()).invalidate();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_args_without_config() {
        assert_eq!(
            self_args(None, &["worker", "run"]),
            vec![OsString::from("worker"), OsString::from("run")]
        );
    }

    #[test]
    fn test_self_args_makes_config_absolute() {
        let args = self_args(Some(Path::new("conf/deferq.toml")), &["supervise"]);
        assert_eq!(args.len(), 3);
        assert_eq!(args[1], OsString::from("--config"));
        assert!(Path::new(&args[2]).is_absolute());
        assert!(Path::new(&args[2]).ends_with("conf/deferq.toml"));
    }
}
