//! # deferq queue
//!
//! Directory-based write-ahead queue.
//!
//! ## Layout
//!
//! ```text
//! {base_dir}/
//! ├── pending/       {priority:02}_{sequence}.json
//! ├── in-flight/
//! ├── completed/
//! ├── failed/
//! ├── quarantine/    records that failed to parse
//! ├── tmp/           staging area for atomic writes
//! ├── counters/
//! └── sequence.counter
//! ```
//!
//! Every transition between partitions is a single `rename(2)`, which is the
//! commit point and the ownership transfer.

pub mod counters;
pub mod enqueue;
pub mod error;
pub mod layout;
pub mod sequencer;
pub mod store;
pub mod task;

pub use counters::{Counter, Counters};
pub use enqueue::{Accepted, EnqueueNotifier, Enqueuer, Rejected};
pub use error::QueueError;
pub use layout::{Partition, QueueLayout};
pub use sequencer::{Sequence, Sequencer};
pub use store::{
    CleanupReport, ClaimedEntry, PartitionDepths, QueueStore, RetentionPolicy, RetryOutcome,
};
pub use task::{DEFAULT_PRIORITY, DEFAULT_TAG, LOWEST_PRIORITY, TOP_PRIORITY, TaskEntry};
