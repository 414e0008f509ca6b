
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn temp_lease() -> (TempDir, WorkerLease) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.lease");
        (dir, WorkerLease::new(path))
    }

    fn write_record(path: &Path, pid: u32) {
        let record = LeaseRecord {
            pid,
            acquired_at: Utc::now(),
        };
        fs::write(path, serde_json::to_vec(&record).unwrap()).unwrap();
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_lease_new() {
        let lease = WorkerLease::new("/tmp/worker.lease");
        assert_eq!(lease.path(), Path::new("/tmp/worker.lease"));
        assert!(!lease.is_held());
    }

    #[test]
    fn test_acquire_fresh() {
        let (_dir, mut lease) = temp_lease();
        let record = lease.try_acquire().unwrap();

        assert_eq!(record.pid, std::process::id());
        assert!(lease.is_held());
        assert_eq!(lease.holder(), Some(record));
        assert_eq!(lease.verify(), LeaseStatus::Held);
    }

    #[test]
    fn test_acquire_rejects_live_holder() {
        let (_dir, mut lease) = temp_lease();
        let mut holder = Command::new("sleep").arg("30").spawn().unwrap();
        write_record(lease.path(), holder.id());

        let err = lease.try_acquire().unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning { pid, .. } if pid == holder.id()));
        assert!(!lease.is_held());

        holder.kill().unwrap();
        holder.wait().unwrap();
    }

    #[test]
    fn test_acquire_reclaims_stale_lease() {
        let (_dir, mut lease) = temp_lease();
        write_record(lease.path(), dead_pid());

        let record = lease.try_acquire().unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(lease.verify(), LeaseStatus::Held);
    }

    #[test]
    fn test_acquire_reclaims_malformed_lease() {
        let (_dir, mut lease) = temp_lease();
        fs::write(lease.path(), b"not json").unwrap();

        assert!(lease.try_acquire().is_ok());
        assert!(lease.holder().is_some());
    }

    #[test]
    fn test_release_removes_file() {
        let (_dir, mut lease) = temp_lease();
        lease.try_acquire().unwrap();
        lease.release().unwrap();

        assert!(!lease.path().exists());
        assert!(!lease.is_held());
        // Releasing twice is harmless
        assert!(lease.release().is_ok());
    }

    #[test]
    fn test_release_leaves_foreign_lease() {
        let (_dir, mut lease) = temp_lease();
        lease.try_acquire().unwrap();
        write_record(lease.path(), 1);

        assert_eq!(lease.verify(), LeaseStatus::Lost { holder: Some(1) });
        lease.release().unwrap();
        assert!(lease.path().exists());
    }

    #[test]
    fn test_drop_releases_lease() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.lease");
        {
            let mut lease = WorkerLease::new(&path);
            lease.try_acquire().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_verify_missing_lease() {
        let (_dir, lease) = temp_lease();
        assert_eq!(lease.verify(), LeaseStatus::Lost { holder: None });
    }

    #[test]
    fn test_force_remove() {
        let (_dir, lease) = temp_lease();
        write_record(lease.path(), 4242);
        WorkerLease::force_remove(lease.path()).unwrap();
        assert!(!lease.path().exists());
        // Missing file is fine
        WorkerLease::force_remove(lease.path()).unwrap();
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subdir").join("deep").join("worker.lease");
        let mut lease = WorkerLease::new(&path);

        lease.try_acquire().unwrap();
        assert!(path.exists());
    }
