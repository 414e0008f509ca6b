
    use super::*;
    use async_trait::async_trait;
    use deferq_queue::{Partition, QueueLayout, TaskEntry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    type Rule = Box<dyn Fn(usize, &[String]) -> Result<(), StoreError> + Send + Sync>;

    /// Store client whose answers are decided by `rule(call_index, payloads)`.
    struct ScriptedStore {
        calls: Mutex<Vec<Vec<String>>>,
        count: AtomicUsize,
        rule: Rule,
    }

    impl ScriptedStore {
        fn new(
            rule: impl Fn(usize, &[String]) -> Result<(), StoreError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
                rule: Box::new(rule),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl StoreClient for ScriptedStore {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn execute_batch(&self, payloads: &[String]) -> Result<(), StoreError> {
            let index = self.count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push(payloads.to_vec());
            (self.rule)(index, payloads)
        }
    }

    fn open_store(dir: &TempDir) -> QueueStore {
        QueueStore::open(QueueLayout::new(dir.path()), false).unwrap()
    }

    fn push(store: &QueueStore, sequence: &str, priority: u8, payload: &str) {
        store
            .commit_pending(&TaskEntry::new(sequence, priority, payload, "test"))
            .unwrap();
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn drainer(
        store: &QueueStore,
        client: Arc<ScriptedStore>,
        signals: &SignalHandler,
    ) -> BatchDrainer {
        BatchDrainer::new(store.clone(), client, fast_retry(3), 10, 3, signals.clone())
    }

    fn read_entry(store: &QueueStore, partition: Partition) -> TaskEntry {
        let names = store.list(partition).unwrap();
        assert_eq!(names.len(), 1, "expected one entry in {}", partition);
        let bytes = std::fs::read(store.layout().partition(partition).join(&names[0])).unwrap();
        TaskEntry::from_json(&names[0], &bytes).unwrap()
    }

    #[tokio::test]
    async fn test_successful_batch_is_one_submission() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        push(&store, "001", 5, "A");
        push(&store, "002", 1, "B");
        push(&store, "003", 3, "C");

        let client = ScriptedStore::new(|_, _| Ok(()));
        let signals = SignalHandler::new();
        let report = drainer(&store, client.clone(), &signals).drain_once().await.unwrap();

        assert_eq!(report.claimed, 3);
        assert_eq!(report.completed, 3);
        assert_eq!(client.calls(), vec![vec!["B".to_string(), "C".to_string(), "A".to_string()]]);
        assert_eq!(store.depth(Partition::Completed), 3);
        assert_eq!(store.depth(Partition::InFlight), 0);
    }

    #[tokio::test]
    async fn test_bad_entry_does_not_sink_the_batch() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        push(&store, "001", 5, "good one");
        push(&store, "002", 5, "BAD");
        push(&store, "003", 5, "good two");

        let client = ScriptedStore::new(|_, payloads| {
            if payloads.iter().any(|p| p == "BAD") {
                Err(StoreError::Permanent("syntax error".to_string()))
            } else {
                Ok(())
            }
        });
        let signals = SignalHandler::new();
        let report = drainer(&store, client.clone(), &signals).drain_once().await.unwrap();

        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        // One batch attempt plus one submission per entry
        assert_eq!(client.calls().len(), 4);

        let failed = read_entry(&store, Partition::Failed);
        assert_eq!(failed.payload, "BAD");
        assert_eq!(failed.last_error.as_deref(), Some("syntax error"));
        assert!(failed.failed_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_error_recovers_within_attempts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        push(&store, "001", 5, "A");

        let client = ScriptedStore::new(|call, _| {
            if call < 2 {
                Err(StoreError::Transient("database is locked".to_string()))
            } else {
                Ok(())
            }
        });
        let signals = SignalHandler::new();
        let report = drainer(&store, client.clone(), &signals).drain_once().await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(client.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_requeue_with_degraded_priority() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        push(&store, "001", 5, "A");

        let client = ScriptedStore::new(|_, _| Err(StoreError::Transient("busy".to_string())));
        let signals = SignalHandler::new();
        let report = drainer(&store, client.clone(), &signals).drain_once().await.unwrap();

        assert_eq!(report.requeued, 1);
        assert_eq!(client.calls().len(), 3);
        assert_eq!(store.list(Partition::Pending).unwrap(), vec!["06_001.json"]);

        let entry = read_entry(&store, Partition::Pending);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some("busy"));
    }

    #[tokio::test]
    async fn test_always_transient_entry_fails_after_max_retries_cycles() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        push(&store, "001", 5, "A");

        let client = ScriptedStore::new(|_, _| Err(StoreError::Transient("locked".to_string())));
        let signals = SignalHandler::new();
        let drainer = drainer(&store, client, &signals);

        let mut cycles = 0;
        while store.depth(Partition::Failed) == 0 {
            let report = drainer.drain_once().await.unwrap();
            assert_eq!(report.claimed, 1);
            cycles += 1;
            assert!(cycles <= 3, "entry never failed");
        }

        assert_eq!(cycles, 3);
        let failed = read_entry(&store, Partition::Failed);
        assert_eq!(failed.retry_count, 3);
        assert_eq!(store.depth(Partition::Pending), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_claiming() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        push(&store, "001", 5, "A");

        let client = ScriptedStore::new(|_, _| Ok(()));
        let signals = SignalHandler::new();
        signals.request_shutdown();
        let report = drainer(&store, client.clone(), &signals).drain_once().await.unwrap();

        assert_eq!(report, DrainReport::default());
        assert!(client.calls().is_empty());
        assert_eq!(store.depth(Partition::Pending), 1);
    }

    #[tokio::test]
    async fn test_entries_held_at_shutdown_are_settled() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        push(&store, "001", 5, "A");
        push(&store, "002", 5, "B");
        push(&store, "003", 5, "C");

        let signals = SignalHandler::new();
        let trigger = signals.clone();
        // The batch attempt fails and a termination signal arrives meanwhile
        let client = ScriptedStore::new(move |call, _| {
            if call == 0 {
                trigger.request_shutdown();
                Err(StoreError::Transient("busy".to_string()))
            } else {
                Ok(())
            }
        });
        let drainer = drainer(&store, client.clone(), &signals);

        let report = drainer.drain_once().await.unwrap();
        assert_eq!(report.held, 3);
        assert_eq!(drainer.held_count(), 3);
        assert_eq!(store.depth(Partition::InFlight), 3);

        let settled = drainer.finish_held(2).await;
        assert_eq!(settled.completed, 2);
        assert_eq!(drainer.held_count(), 0);
        // Past the limit: left for orphan recovery
        assert_eq!(store.depth(Partition::InFlight), 1);
        assert_eq!(store.depth(Partition::Completed), 2);
    }

    #[tokio::test]
    async fn test_transient_at_shutdown_requeues_without_backoff() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        push(&store, "001", 5, "A");

        let signals = SignalHandler::new();
        let trigger = signals.clone();
        let client = ScriptedStore::new(move |_, _| {
            trigger.request_shutdown();
            Err(StoreError::Transient("busy".to_string()))
        });
        let report = drainer(&store, client.clone(), &signals).drain_once().await.unwrap();

        assert_eq!(report.requeued, 1);
        assert_eq!(client.calls().len(), 1);
        assert_eq!(store.list(Partition::Pending).unwrap(), vec!["06_001.json"]);
    }
