
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeferqConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.loop_strategy, LoopStrategyKind::Auto);
        assert_eq!(config.store.kind, StoreKind::Sqlite);
        assert_eq!(config.store.timeout_secs, 30);
        assert!(!config.durable_writes);
    }

    #[test]
    fn test_duration_getters() {
        let config = DeferqConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.idle_exit(), Some(Duration::from_secs(300)));
        assert_eq!(config.retry_base_delay(), Duration::from_millis(100));
        assert_eq!(config.processing_timeout(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.health_cache_ttl(), Duration::from_secs(5));
        assert_eq!(config.sequence_lock_timeout(), Duration::from_secs(1));
        assert_eq!(config.event_read_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_idle_exit_disabled() {
        let config = DeferqConfig {
            idle_exit_secs: 0,
            ..Default::default()
        };
        assert!(config.idle_exit().is_none());
    }

    #[test]
    fn test_store_database_defaults_under_base_dir() {
        let config = DeferqConfig::with_base_dir("/var/lib/deferq");
        assert_eq!(
            config.store_database(),
            PathBuf::from("/var/lib/deferq/store.db")
        );
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/deferq/logs"));
    }

    #[test]
    fn test_loop_strategy_from_str() {
        assert_eq!("auto".parse::<LoopStrategyKind>(), Ok(LoopStrategyKind::Auto));
        assert_eq!("Polling".parse::<LoopStrategyKind>(), Ok(LoopStrategyKind::Polling));
        assert_eq!("event".parse::<LoopStrategyKind>(), Ok(LoopStrategyKind::Event));
        assert!("inotify".parse::<LoopStrategyKind>().is_err());
    }

    #[test]
    fn test_store_kind_from_str() {
        assert_eq!("sqlite".parse::<StoreKind>(), Ok(StoreKind::Sqlite));
        assert_eq!("COMMAND".parse::<StoreKind>(), Ok(StoreKind::Command));
        assert!("postgres".parse::<StoreKind>().is_err());
    }

    #[test]
    fn test_deserialization() {
        let json = r#"{
            "batch_size": 10,
            "loop_strategy": "polling",
            "store": {"kind": "command", "command": "sqlite3 x.db"}
        }"#;
        let config: DeferqConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.loop_strategy, LoopStrategyKind::Polling);
        assert_eq!(config.store.kind, StoreKind::Command);
        assert_eq!(config.store.command.as_deref(), Some("sqlite3 x.db"));
        assert_eq!(config.max_retries, 3);
    }
