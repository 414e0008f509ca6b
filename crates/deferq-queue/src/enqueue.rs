//! Enqueue path.
//!
//! The only blocking step is the sequencer's bounded lock wait. Counting and
//! supervisor notification happen after the commit and cannot fail the call.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use deferq_config::DeferqConfig;
use thiserror::Error;
use tracing::debug;

use crate::counters::Counter;
use crate::error::QueueError;
use crate::layout::QueueLayout;
use crate::sequencer::Sequencer;
use crate::store::QueueStore;
use crate::task::{DEFAULT_TAG, TaskEntry};

/// A committed submission.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub sequence: String,
    pub file_name: String,
    pub path: PathBuf,
    /// `false` when the sequence came from the lock-free fallback.
    pub ordered: bool,
}

/// Why a submission was not committed.
#[derive(Debug, Error)]
pub enum Rejected {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
}

impl From<QueueError> for Rejected {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidArgument(msg) => Rejected::InvalidArgument(msg),
            other => Rejected::QueueUnavailable(other.to_string()),
        }
    }
}

/// Hook invoked after every successful enqueue.
///
/// Implementations must return quickly and never wait for a worker to start.
pub trait EnqueueNotifier: Send + Sync {
    fn notify(&self);
}

impl<F> EnqueueNotifier for F
where
    F: Fn() + Send + Sync,
{
    fn notify(&self) {
        self()
    }
}

pub struct Enqueuer {
    store: QueueStore,
    sequencer: Sequencer,
    notifier: Option<Arc<dyn EnqueueNotifier>>,
}

impl Enqueuer {
    pub fn new(store: QueueStore, sequencer: Sequencer) -> Self {
        Self {
            store,
            sequencer,
            notifier: None,
        }
    }

    pub fn from_config(config: &DeferqConfig) -> Result<Self, QueueError> {
        let layout = QueueLayout::new(config.base_dir.clone());
        let sequencer = Sequencer::new(layout.sequence_file(), config.sequence_lock_timeout());
        let store = QueueStore::open(layout, config.durable_writes)?;
        Ok(Self::new(store, sequencer))
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn EnqueueNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Commit `payload` to `pending/`.
    pub fn enqueue(
        &self,
        payload: &str,
        priority: u8,
        operation_tag: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<Accepted, Rejected> {
        if payload.trim().is_empty() {
            return Err(Rejected::InvalidArgument("payload is empty".to_string()));
        }
        TaskEntry::validate_priority(priority)?;

        let tag = if operation_tag.trim().is_empty() {
            DEFAULT_TAG
        } else {
            operation_tag
        };

        let sequence = self.sequencer.next_sequence();
        let entry = TaskEntry::new(&sequence.id, priority, payload, tag).with_metadata(metadata);
        let path = self.store.commit_pending(&entry)?;

        self.store.counters().increment(Counter::Enqueued);
        if let Some(notifier) = &self.notifier {
            notifier.notify();
        }

        debug!(sequence = %sequence.id, priority, tag = %tag, "entry enqueued");
        Ok(Accepted {
            sequence: sequence.id,
            file_name: entry.file_name(),
            path,
            ordered: sequence.ordered,
        })
    }
}
