//! Enqueue with direct execution as the fallback.
//!
//! When the queue itself is unavailable (directories missing, disk full,
//! permissions) the write is not dropped: it runs synchronously against the
//! store instead. Invalid submissions are never executed.

use std::collections::BTreeMap;

use deferq_queue::{Accepted, Enqueuer, Rejected};
use tracing::warn;

use crate::backend::StoreClient;
use crate::error::WorkerError;

/// Where a submission ended up.
#[derive(Debug, Clone)]
pub enum Disposition {
    Queued(Accepted),
    /// The queue was unavailable and the payload ran against the store.
    ExecutedDirectly,
}

pub async fn enqueue_or_execute(
    enqueuer: &Enqueuer,
    client: &dyn StoreClient,
    payload: &str,
    priority: u8,
    tag: &str,
    metadata: BTreeMap<String, String>,
) -> Result<Disposition, WorkerError> {
    match enqueuer.enqueue(payload, priority, tag, metadata) {
        Ok(accepted) => Ok(Disposition::Queued(accepted)),
        Err(Rejected::QueueUnavailable(reason)) => {
            warn!(
                store = client.id(),
                reason = %reason,
                "Queue unavailable, executing directly"
            );
            client.execute_batch(&[payload.to_string()]).await?;
            Ok(Disposition::ExecutedDirectly)
        }
        Err(rejected) => Err(rejected.into()),
    }
}
