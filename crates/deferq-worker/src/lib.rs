//! # deferq worker
//!
//! Drains the queue into the store.
//!
//! ## Features
//!
//! - `StoreClient` seam with SQLite and external-command implementations
//! - Batch submission with per-entry fallback and exponential backoff
//! - Polling and event-driven loop strategies
//! - Single-instance worker daemon with orphan recovery and retention cleanup
//! - Enqueue with direct execution when the queue is unavailable

pub mod backend;
pub mod daemon;
pub mod drain;
pub mod error;
pub mod fallback;
pub mod retry;
pub mod strategy;
pub mod watcher;

pub use backend::{CommandStore, SqliteStore, StoreClient, open_store};
pub use daemon::{SHUTDOWN_DRAIN_LIMIT, WorkerDaemon, WorkerExit};
pub use drain::{BatchDrainer, DrainReport};
pub use error::{StoreError, WorkerError};
pub use fallback::{Disposition, enqueue_or_execute};
pub use retry::RetryConfig;
pub use strategy::{EventStrategy, LoopStrategy, PollingStrategy, Wake};
pub use watcher::{ChangeWatcher, NotifyWatcher};
