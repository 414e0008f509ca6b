//! Batch draining: claim, execute, settle.
//!
//! A batch of claimed entries is first submitted as one transaction. If that
//! fails, each entry is re-submitted on its own with exponential backoff so a
//! single bad statement cannot hold back the rest of the batch.

use std::sync::Arc;
use std::time::Duration;

use deferq_daemon::SignalHandler;
use deferq_queue::{ClaimedEntry, QueueStore, RetryOutcome};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::StoreClient;
use crate::error::{StoreError, WorkerError};
use crate::retry::RetryConfig;

#[cfg(test)]
#[path = "drain_tests.rs"]
mod tests;

/// What one drain pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub requeued: usize,
    /// Claimed but left for the shutdown path.
    pub held: usize,
}

impl DrainReport {
    pub fn merge(&mut self, other: DrainReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.requeued += other.requeued;
        self.held += other.held;
    }
}

pub struct BatchDrainer {
    store: QueueStore,
    client: Arc<dyn StoreClient>,
    retry: RetryConfig,
    batch_size: usize,
    /// Retry cycles through `pending/` before an entry fails permanently.
    max_retries: u32,
    signals: SignalHandler,
    held: Mutex<Vec<ClaimedEntry>>,
}

impl BatchDrainer {
    pub fn new(
        store: QueueStore,
        client: Arc<dyn StoreClient>,
        retry: RetryConfig,
        batch_size: usize,
        max_retries: u32,
        signals: SignalHandler,
    ) -> Self {
        Self {
            store,
            client,
            retry,
            batch_size: batch_size.max(1),
            max_retries,
            signals,
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Entries claimed but not yet settled because shutdown was requested.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Claim up to `batch_size` entries and settle all of them.
    ///
    /// Claims nothing once shutdown has been requested. Entries still
    /// unsettled when shutdown arrives mid-batch are kept for
    /// [`BatchDrainer::finish_held`].
    pub async fn drain_once(&self) -> Result<DrainReport, WorkerError> {
        if self.signals.is_shutdown_requested() {
            return Ok(DrainReport::default());
        }

        let claimed = self.store.claim_batch(self.batch_size)?;
        let mut report = DrainReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        if claimed.len() > 1 {
            let payloads: Vec<String> = claimed.iter().map(|c| c.entry.payload.clone()).collect();
            match self.client.execute_batch(&payloads).await {
                Ok(()) => {
                    for entry in claimed {
                        self.complete(entry, &mut report);
                    }
                    debug!(size = report.completed, "batch committed");
                    return Ok(report);
                }
                Err(e) => warn!(
                    size = payloads.len(),
                    error = %e,
                    "batch failed, re-submitting entries one by one"
                ),
            }
        }

        let mut remaining = claimed.into_iter();
        while let Some(entry) = remaining.next() {
            if self.signals.is_shutdown_requested() {
                let mut held = self.held.lock();
                held.push(entry);
                held.extend(remaining.by_ref());
                report.held = held.len();
                break;
            }
            self.run_entry(entry, self.retry.max_attempts, &mut report).await;
        }
        Ok(report)
    }

    /// Settle entries held at shutdown with one attempt each. Anything past
    /// `limit` stays in `in-flight/` for orphan recovery.
    pub async fn finish_held(&self, limit: usize) -> DrainReport {
        let held = std::mem::take(&mut *self.held.lock());
        let mut report = DrainReport::default();
        if held.is_empty() {
            return report;
        }

        info!(count = held.len(), "settling entries held at shutdown");
        let total = held.len();
        for entry in held.into_iter().take(limit) {
            self.run_entry(entry, 1, &mut report).await;
        }
        if total > limit {
            warn!(
                left = total - limit,
                "entries left in-flight; orphan recovery will requeue them"
            );
        }
        report
    }

    async fn run_entry(&self, claimed: ClaimedEntry, attempts: u32, report: &mut DrainReport) {
        let payload = [claimed.entry.payload.clone()];
        let mut attempt = 1;
        loop {
            match self.client.execute_batch(&payload).await {
                Ok(()) => {
                    self.complete(claimed, report);
                    return;
                }
                Err(StoreError::Permanent(message)) => {
                    self.fail(claimed, &message, report);
                    return;
                }
                Err(StoreError::Transient(message)) => {
                    if attempt >= attempts || self.signals.is_shutdown_requested() {
                        self.requeue(claimed, &message, report);
                        return;
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        entry = %claimed.file_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient store error, backing off"
                    );
                    self.backoff(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn backoff(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.signals.wait_for_shutdown() => {}
        }
    }

    fn complete(&self, claimed: ClaimedEntry, report: &mut DrainReport) {
        let name = claimed.file_name.clone();
        match self.store.complete(claimed) {
            Ok(()) => report.completed += 1,
            Err(e) => warn!(entry = %name, error = %e, "could not move entry to completed"),
        }
    }

    fn fail(&self, claimed: ClaimedEntry, message: &str, report: &mut DrainReport) {
        let name = claimed.file_name.clone();
        match self.store.fail(claimed, message) {
            Ok(()) => report.failed += 1,
            Err(e) => warn!(entry = %name, error = %e, "could not move entry to failed"),
        }
    }

    fn requeue(&self, claimed: ClaimedEntry, message: &str, report: &mut DrainReport) {
        let name = claimed.file_name.clone();
        match self.store.retry(claimed, message, self.max_retries) {
            Ok(RetryOutcome::Requeued { .. }) => report.requeued += 1,
            Ok(RetryOutcome::Failed) => report.failed += 1,
            Err(e) => warn!(entry = %name, error = %e, "could not requeue entry"),
        }
    }
}
