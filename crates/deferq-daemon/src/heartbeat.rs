//! Worker heartbeat records.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::DaemonError;

/// Liveness record written by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub iteration: u64,
}

impl Heartbeat {
    /// Time since the heartbeat was written; zero for timestamps in the future.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    /// Read the heartbeat at `path`, `None` when missing or malformed.
    pub fn read(path: &Path) -> Option<Self> {
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Remove the heartbeat at `path`.
    pub fn clear(path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove heartbeat {}: {}", path.display(), e);
            }
        }
    }
}

/// Queue snapshot attached to a heartbeat.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeartbeatSnapshot {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub iteration: u64,
}

/// Throttled heartbeat writer.
#[derive(Debug)]
pub struct HeartbeatWriter {
    path: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
}

impl HeartbeatWriter {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last_write: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a heartbeat unless one was written less than `interval` ago.
    /// Returns whether a record was written.
    pub fn beat(&mut self, snapshot: HeartbeatSnapshot) -> Result<bool, DaemonError> {
        if !self.is_due() {
            return Ok(false);
        }
        self.force(snapshot)?;
        Ok(true)
    }

    /// Whether `interval` has passed since the last write.
    pub fn is_due(&self) -> bool {
        self.last_write
            .is_none_or(|last| last.elapsed() >= self.interval)
    }

    /// Write a heartbeat now.
    pub fn force(&mut self, snapshot: HeartbeatSnapshot) -> Result<(), DaemonError> {
        let heartbeat = Heartbeat {
            timestamp: Utc::now(),
            pid: std::process::id(),
            queue_depth: snapshot.queue_depth,
            in_flight: snapshot.in_flight,
            iteration: snapshot.iteration,
        };
        let bytes = serde_json::to_vec(&heartbeat)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.path, &bytes)?;
        self.last_write = Some(Instant::now());
        trace!(iteration = snapshot.iteration, depth = snapshot.queue_depth, "heartbeat written");
        Ok(())
    }

    /// Delete the heartbeat (clean shutdown).
    pub fn remove(&mut self) {
        Heartbeat::clear(&self.path);
        self.last_write = None;
    }
}

/// Replace `path` with `bytes` through a temporary sibling and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    static NEXT_TMP: AtomicU64 = AtomicU64::new(0);
    let tmp = path.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        NEXT_TMP.fetch_add(1, Ordering::Relaxed)
    ));
    let result = fs::File::create(&tmp)
        .and_then(|mut file| file.write_all(bytes))
        .and_then(|_| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_force_writes_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heartbeat.json");
        let mut writer = HeartbeatWriter::new(&path, Duration::from_secs(5));

        writer
            .force(HeartbeatSnapshot {
                queue_depth: 4,
                in_flight: 1,
                iteration: 7,
            })
            .unwrap();

        let heartbeat = Heartbeat::read(&path).unwrap();
        assert_eq!(heartbeat.pid, std::process::id());
        assert_eq!(heartbeat.queue_depth, 4);
        assert_eq!(heartbeat.in_flight, 1);
        assert_eq!(heartbeat.iteration, 7);
        assert!(heartbeat.age() < Duration::from_secs(5));
    }

    #[test]
    fn test_beat_is_throttled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heartbeat.json");
        let mut writer = HeartbeatWriter::new(&path, Duration::from_secs(60));

        assert!(writer.beat(HeartbeatSnapshot::default()).unwrap());
        assert!(!writer.beat(HeartbeatSnapshot { iteration: 2, ..Default::default() }).unwrap());
        assert_eq!(Heartbeat::read(&path).unwrap().iteration, 0);
    }

    #[test]
    fn test_zero_interval_always_writes() {
        let dir = TempDir::new().unwrap();
        let mut writer = HeartbeatWriter::new(dir.path().join("hb"), Duration::ZERO);

        assert!(writer.beat(HeartbeatSnapshot::default()).unwrap());
        assert!(writer.beat(HeartbeatSnapshot::default()).unwrap());
    }

    #[test]
    fn test_remove_and_read_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heartbeat.json");
        let mut writer = HeartbeatWriter::new(&path, Duration::from_secs(5));
        writer.force(HeartbeatSnapshot::default()).unwrap();

        writer.remove();
        assert!(!path.exists());
        assert!(Heartbeat::read(&path).is_none());
    }

    #[test]
    fn test_age_of_old_heartbeat() {
        let heartbeat = Heartbeat {
            timestamp: Utc::now() - chrono::Duration::seconds(90),
            pid: 1,
            queue_depth: 0,
            in_flight: 0,
            iteration: 0,
        };
        assert!(heartbeat.age() >= Duration::from_secs(89));
    }
}
