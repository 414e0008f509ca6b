
    use super::*;
    use tempfile::TempDir;

    fn table_value(path: &Path) -> Vec<i64> {
        let conn = rusqlite::Connection::open(path).unwrap();
        let mut stmt = conn.prepare("SELECT x FROM t ORDER BY rowid").unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    async fn store_with_table(dir: &TempDir, timeout: Duration) -> SqliteStore {
        let path = dir.path().join("store.db");
        let store = SqliteStore::open(&path, timeout).await.unwrap();
        store
            .execute_batch(&["CREATE TABLE t (x INTEGER)".to_string()])
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_frame_batch() {
        let script = frame_batch(&[
            "INSERT INTO t VALUES (1)".to_string(),
            "UPDATE t SET x=2;\n".to_string(),
        ]);
        assert_eq!(
            script,
            "BEGIN IMMEDIATE;\nINSERT INTO t VALUES (1);\nUPDATE t SET x=2;\nCOMMIT;\n"
        );
    }

    #[tokio::test]
    async fn test_sqlite_applies_batch() {
        let dir = TempDir::new().unwrap();
        let store = store_with_table(&dir, Duration::from_secs(5)).await;

        store
            .execute_batch(&[
                "INSERT INTO t VALUES (1)".to_string(),
                "INSERT INTO t VALUES (2); INSERT INTO t VALUES (3)".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(table_value(store.path()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_sqlite_permanent_error_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = store_with_table(&dir, Duration::from_secs(5)).await;

        let err = store
            .execute_batch(&[
                "INSERT INTO t VALUES (1)".to_string(),
                "INSERT INTO missing VALUES (1)".to_string(),
            ])
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert!(err.message().contains("missing"));
        assert!(table_value(store.path()).is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_locked_database_is_transient() {
        let dir = TempDir::new().unwrap();
        let store = store_with_table(&dir, Duration::from_millis(50)).await;

        let blocker = rusqlite::Connection::open(store.path()).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let err = store
            .execute_batch(&["INSERT INTO t VALUES (1)".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_transient(), "unexpected: {}", err);

        blocker.execute_batch("ROLLBACK").unwrap();
        store
            .execute_batch(&["INSERT INTO t VALUES (1)".to_string()])
            .await
            .unwrap();
        assert_eq!(table_value(store.path()), vec![1]);
    }

    #[tokio::test]
    async fn test_sqlite_timeout_rolls_back_slow_batch() {
        let dir = TempDir::new().unwrap();
        let store = store_with_table(&dir, Duration::from_millis(200)).await;

        let slow = "INSERT INTO t WITH RECURSIVE c(n) AS \
                    (SELECT 1 UNION ALL SELECT n + 1 FROM c WHERE n < 500000000) \
                    SELECT max(n) FROM c";
        let started = std::time::Instant::now();
        let err = store
            .execute_batch(&["INSERT INTO t VALUES (7)".to_string(), slow.to_string()])
            .await
            .unwrap_err();

        assert!(err.is_transient(), "unexpected: {}", err);
        assert!(err.message().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));

        // Nothing from the timed-out batch may land later
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(table_value(store.path()).is_empty());

        store
            .execute_batch(&["INSERT INTO t VALUES (1)".to_string()])
            .await
            .unwrap();
        assert_eq!(table_value(store.path()), vec![1]);
    }

    #[tokio::test]
    async fn test_command_store_receives_framed_batch() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("script.sql");
        let store = CommandStore::new(format!("cat > {}", out.display()), Duration::from_secs(5));

        store
            .execute_batch(&["UPDATE t SET x=1".to_string()])
            .await
            .unwrap();

        let script = std::fs::read_to_string(&out).unwrap();
        assert_eq!(script, "BEGIN IMMEDIATE;\nUPDATE t SET x=1;\nCOMMIT;\n");
    }

    #[tokio::test]
    async fn test_command_store_classifies_failures() {
        let permanent = CommandStore::new(
            "cat >/dev/null; echo 'syntax error' >&2; exit 3",
            Duration::from_secs(5),
        );
        let err = permanent.execute_batch(&["x".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("exit code 3"));

        let locked = CommandStore::new(
            "cat >/dev/null; echo 'Error: database is locked' >&2; exit 5",
            Duration::from_secs(5),
        );
        let err = locked.execute_batch(&["x".to_string()]).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_command_store_timeout_is_transient() {
        let store = CommandStore::new("sleep 5", Duration::from_millis(100));
        let err = store.execute_batch(&["x".to_string()]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().contains("timed out"));
    }

    #[tokio::test]
    async fn test_command_store_timeout_kills_background_children() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("applied");
        let store = CommandStore::new(
            format!("cat >/dev/null; (sleep 1; touch {}) & wait", marker.display()),
            Duration::from_millis(200),
        );

        let err = store.execute_batch(&["x".to_string()]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.message().contains("timed out"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "store process outlived the timeout");
    }

    #[tokio::test]
    async fn test_open_store_requires_command() {
        let dir = TempDir::new().unwrap();
        let mut config = DeferqConfig::with_base_dir(dir.path());
        config.store.kind = StoreKind::Command;
        config.store.command = None;

        assert!(matches!(open_store(&config).await, Err(WorkerError::StoreOpen(_))));

        config.store.kind = StoreKind::Sqlite;
        let client = open_store(&config).await.unwrap();
        assert_eq!(client.id(), "sqlite");
    }
