//! Tests for maintenance command execution.

use super::*;
use aicm_delivery::SqliteQueueStore;
use tempfile::TempDir;

fn seed_queue(dir: &TempDir, failed: usize, queued: usize) -> PathBuf {
    let path = dir.path().join("queue.db");
    let store = SqliteQueueStore::open(&path).unwrap();
    for i in 0..failed {
        store.enqueue(&format!("{{\"n\":{}}}", i)).unwrap();
    }
    for entry in store.claim_batch(failed).unwrap() {
        store.mark_failed(entry.id, "boom").unwrap();
    }
    for i in 0..queued {
        store.enqueue(&format!("{{\"q\":{}}}", i)).unwrap();
    }
    path
}

fn cli(db_path: PathBuf, command: Commands) -> Cli {
    Cli {
        db_path,
        log_level: "warn".to_string(),
        command,
    }
}

mod exit_codes {
    use super::*;

    /// A missing database maps to the I/O exit code.
    #[test]
    fn test_missing_database() {
        let dir = TempDir::new().unwrap();
        let error = run(cli(
            dir.path().join("nope.db"),
            Commands::Stats {
                format: OutputFormat::Text,
            },
        ))
        .unwrap_err();

        assert_eq!(error.exit_code(), 2);
    }

    /// A zero limit is a usage error.
    #[test]
    fn test_zero_limit() {
        let dir = TempDir::new().unwrap();
        let path = seed_queue(&dir, 0, 0);
        let error = run(cli(
            path,
            Commands::ListFailed {
                limit: 0,
                format: OutputFormat::Text,
            },
        ))
        .unwrap_err();

        assert_eq!(error.exit_code(), 1);
    }

    /// Busy store errors map to the lock-contention exit code.
    #[test]
    fn test_busy_exit_code() {
        let error = CliError::Store(StoreError::Busy {
            message: "locked".to_string(),
        });
        assert_eq!(error.exit_code(), 3);
    }
}

mod commands {
    use super::*;

    /// Stats runs read-only against a seeded queue.
    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let path = seed_queue(&dir, 2, 3);

        run(cli(
            path,
            Commands::Stats {
                format: OutputFormat::Json,
            },
        ))
        .unwrap();
    }

    /// Requeue without ids resets every failed entry.
    #[test]
    fn test_requeue_all() {
        let dir = TempDir::new().unwrap();
        let path = seed_queue(&dir, 3, 0);

        run(cli(path.clone(), Commands::Requeue { ids: Vec::new() })).unwrap();

        let store = SqliteQueueStore::open(&path).unwrap();
        assert_eq!(store.failed_count().unwrap(), 0);
        assert_eq!(store.stats().unwrap().queued, 3);
    }

    /// Purge with ids deletes only the named entries.
    #[test]
    fn test_purge_by_id() {
        let dir = TempDir::new().unwrap();
        let path = seed_queue(&dir, 2, 0);
        let store = SqliteQueueStore::open(&path).unwrap();
        let first_id = store.list_failed(10).unwrap()[0].id;
        drop(store);

        run(cli(path.clone(), Commands::Purge { ids: vec![first_id] })).unwrap();

        let store = SqliteQueueStore::open(&path).unwrap();
        assert_eq!(store.failed_count().unwrap(), 1);
    }
}

mod parsing {
    use super::*;
    use clap::Parser;

    /// The id list accepts comma-separated values.
    #[test]
    fn test_id_list_parsing() {
        let cli = Cli::try_parse_from([
            "aicm-queue",
            "--db-path",
            "/tmp/q.db",
            "requeue",
            "--ids",
            "1,2,3",
        ])
        .unwrap();

        match cli.command {
            Commands::Requeue { ids } => assert_eq!(ids, vec![1, 2, 3]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    /// The database path is required (argument or AICM_DB_PATH).
    #[test]
    fn test_db_path_required() {
        std::env::remove_var("AICM_DB_PATH");
        let result = Cli::try_parse_from(["aicm-queue", "stats"]);
        assert!(result.is_err());
    }
}
