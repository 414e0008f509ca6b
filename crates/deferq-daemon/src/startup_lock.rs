//! Startup lock: an atomically created directory held while a process
//! decides whether to launch a worker.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::DaemonError;

#[derive(Debug, Clone)]
pub struct StartupLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct StartupLockGuard {
    path: PathBuf,
}

impl StartupLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StartupLockGuard {
    fn drop(&mut self) {
        match fs::remove_dir(&self.path) {
            Ok(()) => debug!("Startup lock released: {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to release startup lock {}: {}", self.path.display(), e),
        }
    }
}

impl StartupLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a lock younger than the timeout currently exists.
    pub fn is_held(&self) -> bool {
        matches!(self.age(), Ok(age) if age <= self.timeout)
    }

    /// Try to take the lock without waiting.
    ///
    /// Returns `None` while another process holds a lock younger than the
    /// timeout. An older lock is force-reclaimed.
    pub fn try_acquire(&self) -> Result<Option<StartupLockGuard>, DaemonError> {
        match self.create() {
            Ok(guard) => return Ok(Some(guard)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(self.error(e)),
        }

        match self.age() {
            Ok(age) if age <= self.timeout => return Ok(None),
            Ok(age) => warn!(
                "Reclaiming startup lock held for {}s: {}",
                age.as_secs(),
                self.path.display()
            ),
            // Released between our create and stat
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.error(e)),
        }

        if !self.reclaim().map_err(|e| self.error(e))? {
            return Ok(None);
        }
        match self.create() {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(self.error(e)),
        }
    }

    fn create(&self) -> io::Result<StartupLockGuard> {
        fs::create_dir(&self.path)?;
        debug!("Startup lock acquired: {}", self.path.display());
        Ok(StartupLockGuard {
            path: self.path.clone(),
        })
    }

    fn age(&self) -> io::Result<Duration> {
        let modified = fs::metadata(&self.path)?.modified()?;
        Ok(modified.elapsed().unwrap_or(Duration::ZERO))
    }

    /// Move the expired lock aside. Returns `false` if what was moved turned
    /// out to be a fresh lock taken by a competitor, which is put back.
    fn reclaim(&self) -> io::Result<bool> {
        let grave = self.path.with_extension(format!(
            "expired.{}.{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        match fs::rename(&self.path, &grave) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        }

        let moved_age = fs::metadata(&grave)?.modified()?.elapsed().unwrap_or(Duration::ZERO);
        if moved_age <= self.timeout {
            if fs::rename(&grave, &self.path).is_err() {
                let _ = fs::remove_dir(&grave);
            }
            return Ok(false);
        }
        fs::remove_dir(&grave)?;
        Ok(true)
    }

    fn error(&self, e: io::Error) -> DaemonError {
        DaemonError::StartupLock {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn backdate_dir(path: &Path, by: Duration) {
        File::open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = StartupLock::new(dir.path().join("startup.lock"), Duration::from_secs(10));

        let guard = lock.try_acquire().unwrap().unwrap();
        assert!(guard.path().is_dir());
        assert!(lock.is_held());
        drop(guard);
        assert!(!lock.is_held());
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = TempDir::new().unwrap();
        let lock = StartupLock::new(dir.path().join("startup.lock"), Duration::from_secs(10));

        let _guard = lock.try_acquire().unwrap().unwrap();
        assert!(lock.try_acquire().unwrap().is_none());
    }

    #[test]
    fn test_expired_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = StartupLock::new(dir.path().join("startup.lock"), Duration::from_secs(10));
        fs::create_dir(lock.path()).unwrap();
        backdate_dir(lock.path(), Duration::from_secs(60));
        assert!(!lock.is_held());

        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());
        // Nothing but the lock itself is left in the base directory
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
