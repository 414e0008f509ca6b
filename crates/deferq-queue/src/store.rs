//! Queue store: partitions and atomic transitions.
//!
//! ```text
//! pending ──claim──▶ in-flight ──complete──▶ completed
//!    ▲                   │ └─────fail──────▶ failed
//!    └──────retry────────┘
//! ```
//!
//! Records are only rewritten while they sit in `in-flight` (or `failed`,
//! for replay), through a staged file renamed over the original.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use deferq_config::DeferqConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::counters::{Counter, Counters};
use crate::error::QueueError;
use crate::layout::{Partition, QueueLayout};
use crate::sequencer::now_nanos;
use crate::task::{ENTRY_EXTENSION, TaskEntry};

/// Staging leftovers older than this are removed by the janitor.
pub const STAGING_RETENTION: Duration = Duration::from_secs(3600);

/// An entry exclusively owned by this process under `in-flight/`.
#[derive(Debug, Clone)]
pub struct ClaimedEntry {
    pub entry: TaskEntry,
    pub file_name: String,
    path: PathBuf,
}

impl ClaimedEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of a retry transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in `pending/` under a new name.
    Requeued { file_name: String },
    /// Retries exhausted; moved to `failed/`.
    Failed,
}

/// Retention windows used by the janitor.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub completed: Duration,
    pub failed: Duration,
    pub staging: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &DeferqConfig) -> Self {
        Self {
            completed: config.completed_retention(),
            failed: config.failed_retention(),
            staging: STAGING_RETENTION,
        }
    }
}

/// Files removed by one janitor pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub completed: usize,
    pub failed: usize,
    pub staging: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.staging
    }
}

/// Entry count per partition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDepths {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub quarantine: usize,
}

/// Filesystem-backed queue.
#[derive(Debug, Clone)]
pub struct QueueStore {
    layout: QueueLayout,
    counters: Counters,
    durable: bool,
}

impl QueueStore {
    /// Open the queue at `layout`, creating missing directories.
    ///
    /// With `durable` set, staged records are fsynced before they are renamed
    /// into place.
    pub fn open(layout: QueueLayout, durable: bool) -> Result<Self, QueueError> {
        layout.ensure()?;
        let counters = Counters::new(layout.counters());
        debug!("QueueStore opened at {:?}", layout.base());
        Ok(Self {
            layout,
            counters,
            durable,
        })
    }

    pub fn from_config(config: &DeferqConfig) -> Result<Self, QueueError> {
        Self::open(QueueLayout::new(config.base_dir.clone()), config.durable_writes)
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Entry file names of `partition`, in execution order.
    pub fn list(&self, partition: Partition) -> Result<Vec<String>, QueueError> {
        let dir = self.layout.partition(partition);
        let read_dir = fs::read_dir(&dir)
            .map_err(|e| QueueError::unavailable(format!("list {}", partition), e))?;

        let mut names: Vec<String> = read_dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| Path::new(name).extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn depth(&self, partition: Partition) -> usize {
        self.list(partition).map(|names| names.len()).unwrap_or(0)
    }

    pub fn depths(&self) -> PartitionDepths {
        PartitionDepths {
            pending: self.depth(Partition::Pending),
            in_flight: self.depth(Partition::InFlight),
            completed: self.depth(Partition::Completed),
            failed: self.depth(Partition::Failed),
            quarantine: self.depth(Partition::Quarantine),
        }
    }

    /// Commit a new record into `pending/`.
    ///
    /// The record is staged under `tmp/` and renamed into place; the rename is
    /// the commit point. On error nothing is left in `pending/`.
    pub fn commit_pending(&self, entry: &TaskEntry) -> Result<PathBuf, QueueError> {
        let file_name = entry.file_name();
        let staging = self
            .layout
            .tmp()
            .join(format!("{}.{}.stage", file_name, std::process::id()));
        let bytes = entry.to_json()?;

        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&staging)?;
            file.write_all(&bytes)?;
            if self.durable {
                file.sync_all()?;
            }
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&staging);
            return Err(QueueError::unavailable(format!("stage {}", file_name), e));
        }

        let target = self.layout.pending().join(&file_name);
        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_file(&staging);
            return Err(QueueError::unavailable(format!("commit {}", file_name), e));
        }

        debug!(entry = %file_name, "entry committed to pending");
        Ok(target)
    }

    /// Claim up to `max` entries in execution order.
    ///
    /// Entries taken by another claimer are skipped silently; entries that hit
    /// an IO error are logged and skipped.
    pub fn claim_batch(&self, max: usize) -> Result<Vec<ClaimedEntry>, QueueError> {
        let mut claimed = Vec::new();
        if max == 0 {
            return Ok(claimed);
        }

        for name in self.list(Partition::Pending)? {
            match self.claim(&name) {
                Ok(Some(entry)) => {
                    claimed.push(entry);
                    if claimed.len() >= max {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(entry = %name, error = %e, "claim failed, skipping entry"),
            }
        }
        Ok(claimed)
    }

    /// Claim a single pending entry by name.
    ///
    /// Returns `None` when the entry was already claimed elsewhere or turned
    /// out to be unparseable (it is quarantined in that case).
    pub fn claim(&self, file_name: &str) -> Result<Option<ClaimedEntry>, QueueError> {
        let from = self.layout.pending().join(file_name);
        let to = self.layout.in_flight().join(file_name);

        match fs::rename(&from, &to) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(entry = %file_name, "entry claimed elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(QueueError::unavailable(format!("claim {}", file_name), e)),
        }

        // The orphan clock starts at claim time, not at enqueue time
        touch(&to);

        let bytes =
            fs::read(&to).map_err(|e| QueueError::from_io(format!("read {}", file_name), e))?;
        match TaskEntry::from_json(file_name, &bytes) {
            Ok(entry) => {
                debug!(
                    entry = %file_name,
                    priority = entry.priority,
                    tag = %entry.operation_tag,
                    retry_count = entry.retry_count,
                    "entry claimed"
                );
                Ok(Some(ClaimedEntry {
                    entry,
                    file_name: file_name.to_string(),
                    path: to,
                }))
            }
            Err(e) => {
                self.quarantine(Partition::InFlight, file_name, &e);
                Ok(None)
            }
        }
    }

    /// Move a claimed entry to `completed/`.
    pub fn complete(&self, claimed: ClaimedEntry) -> Result<(), QueueError> {
        let target = self.layout.partition(Partition::Completed).join(&claimed.file_name);
        fs::rename(&claimed.path, &target)
            .map_err(|e| QueueError::from_io(format!("complete {}", claimed.file_name), e))?;
        touch(&target);
        self.counters.increment(Counter::Completed);
        debug!(entry = %claimed.file_name, tag = %claimed.entry.operation_tag, "entry completed");
        Ok(())
    }

    /// Annotate a claimed entry with `error` and move it to `failed/`.
    pub fn fail(&self, claimed: ClaimedEntry, error: &str) -> Result<(), QueueError> {
        let ClaimedEntry {
            entry,
            file_name,
            path,
        } = claimed;
        self.fail_entry(entry, &file_name, &path, error)
    }

    /// Retry transition: bump `retry_count` and degrade the priority, or fail
    /// the entry once `retry_count` reaches `max_retries`.
    pub fn retry(
        &self,
        claimed: ClaimedEntry,
        error: &str,
        max_retries: u32,
    ) -> Result<RetryOutcome, QueueError> {
        let ClaimedEntry {
            mut entry,
            file_name,
            path,
        } = claimed;

        entry.retry_count += 1;
        if entry.retry_count >= max_retries {
            self.fail_entry(entry, &file_name, &path, error)?;
            return Ok(RetryOutcome::Failed);
        }

        entry.last_error = Some(error.to_string());
        entry.degrade_priority();
        let new_name = entry.file_name();

        self.rewrite(&path, &entry, &file_name)?;
        let target = self.layout.pending().join(&new_name);
        fs::rename(&path, &target)
            .map_err(|e| QueueError::from_io(format!("requeue {}", file_name), e))?;

        self.counters.increment(Counter::Retried);
        debug!(
            entry = %file_name,
            requeued_as = %new_name,
            retry_count = entry.retry_count,
            "entry requeued"
        );
        Ok(RetryOutcome::Requeued {
            file_name: new_name,
        })
    }

    fn fail_entry(
        &self,
        mut entry: TaskEntry,
        file_name: &str,
        path: &Path,
        error: &str,
    ) -> Result<(), QueueError> {
        entry.annotate_failure(error);
        self.rewrite(path, &entry, file_name)?;

        let target = self.layout.partition(Partition::Failed).join(file_name);
        fs::rename(path, &target)
            .map_err(|e| QueueError::from_io(format!("fail {}", file_name), e))?;

        self.counters.increment(Counter::Failed);
        warn!(
            entry = %file_name,
            tag = %entry.operation_tag,
            retry_count = entry.retry_count,
            error = %error,
            "entry failed permanently"
        );
        Ok(())
    }

    /// Force in-flight entries older than `older_than` through the retry
    /// transition. Returns the number of entries recovered.
    pub fn recover_orphans(
        &self,
        older_than: Duration,
        max_retries: u32,
    ) -> Result<usize, QueueError> {
        let mut recovered = 0;

        for name in self.list(Partition::InFlight)? {
            let path = self.layout.in_flight().join(&name);
            match age(&path) {
                Ok(age) if age >= older_than => {}
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(entry = %name, error = %e, "cannot stat in-flight entry");
                    continue;
                }
            }

            let entry = match self.read_entry(&path, &name) {
                Ok(entry) => entry,
                Err(QueueError::NotFound(_)) => continue,
                Err(e @ QueueError::Corrupt { .. }) => {
                    self.quarantine(Partition::InFlight, &name, &e);
                    continue;
                }
                Err(e) => {
                    warn!(entry = %name, error = %e, "cannot read in-flight entry");
                    continue;
                }
            };

            let claimed = ClaimedEntry {
                entry,
                file_name: name.clone(),
                path,
            };
            match self.retry(claimed, "orphaned: processing timeout exceeded", max_retries) {
                Ok(_) => {
                    recovered += 1;
                    self.counters.increment(Counter::Recovered);
                }
                Err(e) => warn!(entry = %name, error = %e, "orphan recovery failed"),
            }
        }

        if recovered > 0 {
            info!(recovered, "recovered orphaned entries");
        }
        Ok(recovered)
    }

    /// Move every entry in `failed/` back to `pending/` with its retry state
    /// cleared. Returns the number of entries replayed.
    pub fn replay_failed(&self) -> Result<usize, QueueError> {
        let failed_dir = self.layout.partition(Partition::Failed);
        let mut replayed = 0;

        for name in self.list(Partition::Failed)? {
            let path = failed_dir.join(&name);
            let mut entry = match self.read_entry(&path, &name) {
                Ok(entry) => entry,
                Err(e @ QueueError::Corrupt { .. }) => {
                    self.quarantine(Partition::Failed, &name, &e);
                    continue;
                }
                Err(e) => {
                    warn!(entry = %name, error = %e, "cannot read failed entry");
                    continue;
                }
            };

            entry.reset_for_replay();
            self.rewrite(&path, &entry, &name)?;
            let target = self.layout.pending().join(entry.file_name());
            fs::rename(&path, &target)
                .map_err(|e| QueueError::from_io(format!("replay {}", name), e))?;
            replayed += 1;
        }

        if replayed > 0 {
            info!(replayed, "replayed failed entries");
        }
        Ok(replayed)
    }

    /// Remove terminal entries and staging leftovers past their retention.
    pub fn cleanup(&self, policy: &RetentionPolicy) -> CleanupReport {
        let report = CleanupReport {
            completed: remove_older_than(
                &self.layout.partition(Partition::Completed),
                policy.completed,
            ),
            failed: remove_older_than(&self.layout.partition(Partition::Failed), policy.failed),
            staging: remove_older_than(&self.layout.tmp(), policy.staging),
        };
        if report.total() > 0 {
            debug!(
                completed = report.completed,
                failed = report.failed,
                staging = report.staging,
                "janitor removed expired files"
            );
        }
        report
    }

    fn read_entry(&self, path: &Path, name: &str) -> Result<TaskEntry, QueueError> {
        let bytes = fs::read(path).map_err(|e| QueueError::from_io(format!("read {}", name), e))?;
        TaskEntry::from_json(name, &bytes)
    }

    /// Atomically replace `path` with the serialized `entry`.
    fn rewrite(&self, path: &Path, entry: &TaskEntry, file_name: &str) -> Result<(), QueueError> {
        let staging = self
            .layout
            .tmp()
            .join(format!("{}.{}.{}.rewrite", file_name, std::process::id(), now_nanos()));
        let bytes = entry.to_json()?;

        let write = || -> io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&staging)?;
            file.write_all(&bytes)?;
            if self.durable {
                file.sync_all()?;
            }
            fs::rename(&staging, path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&staging);
            QueueError::unavailable(format!("rewrite {}", file_name), e)
        })
    }

    fn quarantine(&self, from: Partition, file_name: &str, reason: &QueueError) {
        let source = self.layout.partition(from).join(file_name);
        let target = self.layout.partition(Partition::Quarantine).join(file_name);
        match fs::rename(&source, &target) {
            Ok(()) => {
                self.counters.increment(Counter::Quarantined);
                warn!(entry = %file_name, from = %from, reason = %reason, "entry quarantined");
            }
            Err(e) => warn!(entry = %file_name, error = %e, "failed to quarantine entry"),
        }
    }
}

fn touch(path: &Path) {
    let result = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file: File| file.set_modified(SystemTime::now()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to update mtime");
    }
}

fn age(path: &Path) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified.elapsed().unwrap_or(Duration::ZERO))
}

fn remove_older_than(dir: &Path, retention: Duration) -> usize {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in read_dir.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match age(&path) {
            Ok(age) if age >= retention => {
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
            _ => {}
        }
    }
    removed
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
