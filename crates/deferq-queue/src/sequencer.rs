//! Submission sequencer.
//!
//! The locked path reads `counter last_ts` from the counter file, bumps both
//! and writes them back, yielding `{ts:020}-{counter:010}`. `ts` is at least
//! `last_ts + 1`, so locked sequences strictly increase across processes even
//! when the wall clock steps backwards.
//!
//! When the lock cannot be taken within the configured wait, the sequence is
//! `{ts:020}-p{pid:010}-{local:06}`: unique, but only ordered by time.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Shared by every sequencer in the process so fallback ids never repeat.
static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A generated sequence identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub id: String,
    /// `false` when produced by the lock-free fallback.
    pub ordered: bool,
}

/// Produces collision-free, sortable sequence identifiers.
pub struct Sequencer {
    path: PathBuf,
    lock_timeout: Duration,
}

impl Sequencer {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    /// Next sequence. Blocks at most for the lock timeout and never fails.
    pub fn next_sequence(&self) -> Sequence {
        match self.next_locked() {
            Ok(id) => Sequence { id, ordered: true },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %self.path.display(),
                    "sequence lock unavailable, using fallback"
                );
                Sequence {
                    id: self.next_fallback(),
                    ordered: false,
                }
            }
        }
    }

    fn next_locked(&self) -> io::Result<String> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        let mut locked = lock_exclusive(file, Instant::now() + self.lock_timeout)?;

        let mut content = String::new();
        locked.read_to_string(&mut content)?;
        let (counter, last_ts) = parse_state(&content);

        let counter = counter.wrapping_add(1);
        let ts = now_nanos().max(last_ts.saturating_add(1));

        locked.seek(SeekFrom::Start(0))?;
        locked.set_len(0)?;
        locked.write_all(format!("{} {}\n", counter, ts).as_bytes())?;

        let id = format!("{:020}-{:010}", ts, counter % 10_000_000_000);
        debug!(sequence = %id, "sequence issued");
        Ok(id)
    }

    fn next_fallback(&self) -> String {
        let local = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!(
            "{:020}-p{:010}-{:06}",
            now_nanos(),
            std::process::id(),
            local % 1_000_000
        )
    }
}

/// Take an exclusive advisory lock, retrying until `deadline`.
pub(crate) fn lock_exclusive(file: File, deadline: Instant) -> io::Result<Flock<File>> {
    let mut file = file;
    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => return Ok(locked),
            Err((f, errno)) if errno == Errno::EWOULDBLOCK || errno == Errno::EINTR => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out waiting for file lock",
                    ));
                }
                file = f;
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err((_, errno)) => return Err(io::Error::from(errno)),
        }
    }
}

fn parse_state(content: &str) -> (u64, u64) {
    let mut parts = content.split_whitespace();
    let counter = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let last_ts = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (counter, last_ts)
}

pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
