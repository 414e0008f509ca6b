//! Worker lease: "I am the active worker".

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::process::is_process_running;

/// Attempts at create-or-reclaim before giving up.
const ACQUIRE_ATTEMPTS: usize = 3;

/// On-disk lease content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

/// Result of re-reading the lease while holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held,
    /// The lease is gone or names another process.
    Lost { holder: Option<u32> },
}

/// Worker lease manager.
#[derive(Debug)]
pub struct WorkerLease {
    path: PathBuf,
    held: bool,
}

impl WorkerLease {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Current lease record; unreadable or malformed leases read as `None`.
    pub fn holder(&self) -> Option<LeaseRecord> {
        read_record(&self.path).ok().flatten()
    }

    /// Acquire the lease for this process.
    ///
    /// A lease whose holder is no longer running is reclaimed. A lease held
    /// by a live process yields [`DaemonError::AlreadyRunning`].
    pub fn try_acquire(&mut self) -> Result<LeaseRecord, DaemonError> {
        let own_pid = std::process::id();

        for _ in 0..ACQUIRE_ATTEMPTS {
            let record = LeaseRecord::current();
            match create_record(&self.path, &record) {
                Ok(()) => {
                    self.held = true;
                    info!("Lease acquired: {} (PID: {})", self.path.display(), record.pid);
                    return Ok(record);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(DaemonError::LeaseCreation {
                        path: self.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }

            let existing = self.holder();
            match &existing {
                Some(record) if record.pid == own_pid => {
                    self.held = true;
                    return Ok(record.clone());
                }
                Some(record) if is_process_running(record.pid) => {
                    return Err(DaemonError::AlreadyRunning {
                        path: self.path.clone(),
                        pid: record.pid,
                    });
                }
                _ => {}
            }

            warn!(
                "Reclaiming stale lease (holder {:?} not running): {}",
                existing.as_ref().map(|r| r.pid),
                self.path.display()
            );
            reclaim_stale(&self.path, existing.as_ref()).map_err(|e| DaemonError::LeaseCreation {
                path: self.path.clone(),
                reason: format!("failed to reclaim stale lease: {}", e),
            })?;
        }

        Err(DaemonError::LeaseCreation {
            path: self.path.clone(),
            reason: "lease is contended".to_string(),
        })
    }

    /// Re-read the lease and confirm this process still holds it.
    pub fn verify(&self) -> LeaseStatus {
        match self.holder() {
            Some(record) if record.pid == std::process::id() => LeaseStatus::Held,
            Some(record) => LeaseStatus::Lost {
                holder: Some(record.pid),
            },
            None => LeaseStatus::Lost { holder: None },
        }
    }

    /// Release the lease if this process holds it.
    pub fn release(&mut self) -> Result<(), DaemonError> {
        if !self.held {
            return Ok(());
        }
        self.held = false;

        if self.verify() != LeaseStatus::Held {
            debug!("Lease no longer ours, leaving it in place: {}", self.path.display());
            return Ok(());
        }
        remove_if_exists(&self.path).map_err(|e| DaemonError::LeaseRemoval {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        info!("Lease released: {}", self.path.display());
        Ok(())
    }

    /// Remove the lease regardless of holder (used after the holder died).
    pub fn force_remove(path: &Path) -> Result<(), DaemonError> {
        debug!("Force removing lease: {}", path.display());
        remove_if_exists(path).map_err(|e| DaemonError::LeaseRemoval {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.release() {
                warn!("Failed to release lease on drop: {}", e);
            }
        }
    }
}

fn read_record(path: &Path) -> io::Result<Option<LeaseRecord>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn create_record(path: &Path, record: &LeaseRecord) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes =
        serde_json::to_vec(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.write_all(&bytes).and_then(|_| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

/// Move a stale lease out of the way.
///
/// The lease is renamed to a private name first. If what was moved is not
/// the record judged stale, a competitor replaced it in between and it is
/// linked back without clobbering anything newer.
fn reclaim_stale(path: &Path, observed: Option<&LeaseRecord>) -> io::Result<()> {
    let grave = path.with_extension(format!(
        "stale.{}.{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    match fs::rename(path, &grave) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    let taken = read_record(&grave).ok().flatten();
    if observed.is_some() && taken.as_ref() != observed {
        if let Err(e) = fs::hard_link(&grave, path) {
            debug!("Could not restore replaced lease: {}", e);
        }
    }
    remove_if_exists(&grave)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;
