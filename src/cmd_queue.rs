//! Queue subcommand handlers for deferq.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use deferq_config::DeferqConfig;
use deferq_daemon::{EnsureOutcome, HelperDispatch, StartOutcome, StatusReport, Supervisor};
use deferq_queue::{Enqueuer, QueueStore, RetentionPolicy};
use deferq_worker::{Disposition, enqueue_or_execute, open_store};

use crate::cmd_worker::{self_args, start_worker};

/// Supervisor whose starts run in a detached `deferq supervise` helper, so
/// short-lived callers never wait for a worker to come up.
fn helper_supervisor(
    config: &DeferqConfig,
    config_path: Option<&Path>,
) -> Result<Supervisor, Box<dyn std::error::Error>> {
    let program = std::env::current_exe()?;
    let dispatch = HelperDispatch::new(program, self_args(config_path, &["supervise"]));
    Ok(Supervisor::from_config(config, Box::new(dispatch)))
}

/// Queue one payload.
pub(crate) async fn enqueue(
    config: DeferqConfig,
    config_path: Option<&Path>,
    priority: u8,
    tag: String,
    metadata: Vec<(String, String)>,
    fallback_direct: bool,
    payload: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = match payload {
        Some(payload) => payload,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf.trim_end().to_string()
        }
    };
    let metadata: BTreeMap<String, String> = metadata.into_iter().collect();
    let supervisor = Arc::new(helper_supervisor(&config, config_path)?);

    if !fallback_direct {
        let enqueuer = Enqueuer::from_config(&config)?.with_notifier(supervisor);
        let accepted = enqueuer.enqueue(&payload, priority, &tag, metadata)?;
        println!("{}", accepted.file_name);
        return Ok(());
    }

    let client = open_store(&config).await?;
    let enqueuer = match Enqueuer::from_config(&config) {
        Ok(enqueuer) => enqueuer.with_notifier(supervisor),
        Err(e) => {
            // The queue directories themselves are unusable
            warn!("Queue unavailable ({}), executing directly", e);
            client.execute_batch(&[payload]).await?;
            println!("executed directly");
            return Ok(());
        }
    };

    let disposition =
        enqueue_or_execute(&enqueuer, client.as_ref(), &payload, priority, &tag, metadata).await?;
    match disposition {
        Disposition::Queued(accepted) => println!("{}", accepted.file_name),
        Disposition::ExecutedDirectly => println!("executed directly"),
    }
    Ok(())
}

/// Non-blocking health check with a detached start when needed.
pub(crate) fn ensure(
    config: DeferqConfig,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcome = helper_supervisor(&config, config_path)?.ensure_worker_running();
    match outcome {
        EnsureOutcome::Healthy => println!("Worker is healthy"),
        EnsureOutcome::StartPending => println!("Worker start already in progress"),
        EnsureOutcome::StartDispatched => println!("Worker start dispatched"),
        EnsureOutcome::DispatchFailed => return Err("failed to dispatch worker start".into()),
    }
    Ok(())
}

/// Body of the detached helper spawned by [`ensure`] and enqueue.
pub(crate) async fn supervise(
    config: DeferqConfig,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    match start_worker(&config, config_path).await? {
        StartOutcome::AlreadyHealthy => debug!("Worker already healthy"),
        StartOutcome::Launched { pid } => info!(pid, "Worker launched by supervisor"),
        StartOutcome::LaunchTimedOut => warn!("Launched worker did not take the lease in time"),
        StartOutcome::LockBusy => debug!("Another supervisor holds the startup lock"),
    }
    Ok(())
}

/// Print worker and queue status.
pub(crate) fn status(config: DeferqConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = QueueStore::from_config(&config)?;
    let report = StatusReport::collect(&store);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("deferq Status");
        println!("=============");
        println!("{}", report);
    }
    Ok(())
}

/// Move failed entries back to pending and make sure a worker picks them up.
pub(crate) fn replay(
    config: DeferqConfig,
    config_path: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = QueueStore::from_config(&config)?;
    let replayed = store.replay_failed()?;
    println!("Replayed {} entries", replayed);

    if replayed > 0 {
        let outcome = helper_supervisor(&config, config_path)?.ensure_worker_running();
        debug!(?outcome, "Worker ensured after replay");
    }
    Ok(())
}

/// Apply the retention policy once.
pub(crate) fn cleanup(config: DeferqConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = QueueStore::from_config(&config)?;
    let report = store.cleanup(&RetentionPolicy::from_config(&config));
    println!(
        "Removed {} entries (completed={} failed={} staging={})",
        report.total(),
        report.completed,
        report.failed,
        report.staging
    );
    Ok(())
}
