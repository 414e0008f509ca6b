//! Best-effort persistent counters.
//!
//! Each counter is a small file under `counters/`. Increments take a
//! non-blocking lock and are dropped when the lock is busy, so they never
//! slow down or fail the operation being counted.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Instant;

use tracing::trace;

use crate::sequencer::lock_exclusive;

/// Known counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Enqueued,
    Completed,
    Failed,
    Retried,
    Recovered,
    Quarantined,
}

impl Counter {
    pub const ALL: [Counter; 6] = [
        Counter::Enqueued,
        Counter::Completed,
        Counter::Failed,
        Counter::Retried,
        Counter::Recovered,
        Counter::Quarantined,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::Enqueued => "enqueued",
            Counter::Completed => "completed",
            Counter::Failed => "failed",
            Counter::Retried => "retried",
            Counter::Recovered => "recovered",
            Counter::Quarantined => "quarantined",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Counters {
    dir: PathBuf,
}

impl Counters {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Increment `counter` by one. Returns whether the increment was recorded.
    pub fn increment(&self, counter: Counter) -> bool {
        match self.try_increment(counter) {
            Ok(()) => true,
            Err(e) => {
                trace!(counter = counter.name(), error = %e, "counter increment skipped");
                false
            }
        }
    }

    fn try_increment(&self, counter: Counter) -> io::Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(counter.name()))?;
        // A deadline in the past makes this a single non-blocking attempt
        let mut locked = lock_exclusive(file, Instant::now())?;

        let mut content = String::new();
        locked.read_to_string(&mut content)?;
        let value = content.trim().parse::<u64>().unwrap_or(0) + 1;

        locked.seek(SeekFrom::Start(0))?;
        locked.set_len(0)?;
        locked.write_all(value.to_string().as_bytes())?;
        Ok(())
    }

    /// Current value, zero when missing or unreadable.
    pub fn get(&self, counter: Counter) -> u64 {
        fs::read_to_string(self.dir.join(counter.name()))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_increment_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let counters = Counters::new(temp_dir.path());

        assert_eq!(counters.get(Counter::Enqueued), 0);
        assert!(counters.increment(Counter::Enqueued));
        assert!(counters.increment(Counter::Enqueued));
        assert!(counters.increment(Counter::Failed));

        assert_eq!(counters.get(Counter::Enqueued), 2);
        assert_eq!(counters.get(Counter::Failed), 1);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot["enqueued"], 2);
        assert_eq!(snapshot["completed"], 0);
        assert_eq!(snapshot.len(), Counter::ALL.len());
    }

    #[test]
    fn test_increment_missing_dir_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let counters = Counters::new(temp_dir.path().join("absent"));
        assert!(!counters.increment(Counter::Retried));
        assert_eq!(counters.get(Counter::Retried), 0);
    }
}
