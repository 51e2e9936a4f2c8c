//! Durable on-disk queue store.
//!
//! A single-file SQLite database with a WAL journal holds the queue.
//! Every mutation runs inside a transaction; batch claims use an
//! immediate transaction so two workers sharing one file (separate
//! processes included) can never dispatch the same entry twice.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// On-disk schema version recorded in the `meta` table
pub const SCHEMA_VERSION: i64 = 1;

/// How long to wait on a locked database before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Errors
// ============================================================================

/// Errors from the durable queue store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another connection holds a conflicting lock.
    #[error("Queue database is busy: {message}")]
    Busy { message: String },

    /// The database file or its directory is unusable.
    #[error("Queue database I/O error: {message}")]
    Io { message: String },

    /// The file was written by an incompatible SDK version.
    #[error("Queue schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: i64, expected: i64 },

    /// Any other SQLite-level failure.
    #[error("Queue database error: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, ref message) = error {
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) {
                return Self::Busy {
                    message: message.clone().unwrap_or_else(|| failure.to_string()),
                };
            }
        }
        Self::Sqlite(error)
    }
}

impl StoreError {
    /// Whether retrying the operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Whether this is a lock-contention failure
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

// ============================================================================
// Entry Types
// ============================================================================

/// Lifecycle state of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Queued,
    Inflight,
    Failed,
    Done,
}

impl EntryStatus {
    /// Status as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Inflight => "INFLIGHT",
            Self::Failed => "FAILED",
            Self::Done => "DONE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "INFLIGHT" => Some(Self::Inflight),
            "FAILED" => Some(Self::Failed),
            "DONE" => Some(Self::Done),
            _ => None,
        }
    }
}

/// A durable queue row
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub status: EntryStatus,
    pub payload: String,
    pub last_error: Option<String>,
}

/// Row counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: u64,
    pub inflight: u64,
    pub failed: u64,
    pub done: u64,
}

impl QueueStats {
    /// Total rows in the queue table
    pub fn total(&self) -> u64 {
        self.queued + self.inflight + self.failed + self.done
    }
}

// ============================================================================
// SqliteQueueStore
// ============================================================================

/// Durable queue backed by a single SQLite file.
///
/// All methods are synchronous; async callers run them under
/// `spawn_blocking`. While a row is INFLIGHT its `next_attempt_at`
/// column records the claim time, which is what the reclaim scan keys
/// off.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteQueueStore {
    /// Open (creating if needed) the queue database at `path`.
    ///
    /// The parent directory is created, the WAL journal and full
    /// synchronous mode are enabled, and the schema version is checked.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                message: format!("failed to create queue directory: {}", e),
            })?;
        }

        let conn = Connection::open(&path)?;
        // WAL allows a reader (the maintenance tool) alongside the
        // worker's writes; synchronous=FULL makes enqueue fsync-backed.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 created_at INTEGER NOT NULL,
                 next_attempt_at INTEGER NOT NULL,
                 attempt_count INTEGER NOT NULL DEFAULT 0,
                 status TEXT NOT NULL
                     CHECK (status IN ('QUEUED','INFLIGHT','FAILED','DONE')),
                 payload BLOB NOT NULL,
                 last_error TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_queue_status_next_attempt
                 ON queue (status, next_attempt_at);
             CREATE TABLE IF NOT EXISTS meta (
                 key TEXT PRIMARY KEY,
                 value TEXT
             );",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            path,
        };
        store.check_schema_version()?;
        Ok(store)
    }

    /// Open an existing queue database without write access.
    ///
    /// Used by inspection commands so they can run next to a live
    /// worker.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Io {
            message: format!("failed to open queue database {}: {}", path.display(), e),
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let store = Self {
            conn: Mutex::new(conn),
            path,
        };
        store.check_schema_version()?;
        Ok(store)
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_schema_version(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        let found: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match found {
            Some(value) => {
                let found = value.parse::<i64>().unwrap_or(-1);
                if found != SCHEMA_VERSION {
                    return Err(StoreError::SchemaVersion {
                        found,
                        expected: SCHEMA_VERSION,
                    });
                }
            }
            None => {
                // Read-only connections tolerate the missing marker; a
                // writable open stamps it.
                let _ = conn.execute(
                    "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                );
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Worker operations
    // ------------------------------------------------------------------

    /// Insert one entry; returns its id. The commit is fsync-backed, so
    /// a crash after return cannot lose the record.
    pub fn enqueue(&self, payload: &str) -> Result<i64, StoreError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO queue (created_at, next_attempt_at, attempt_count, status, payload)
             VALUES (?1, ?2, 0, 'QUEUED', ?3)",
            params![now, now, payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Atomically claim up to `limit` eligible entries for dispatch.
    ///
    /// Runs as an immediate transaction: eligible QUEUED rows are
    /// selected in id order and flipped to INFLIGHT before commit, so a
    /// concurrent worker cannot claim the same rows.
    pub fn claim_batch(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut entries = {
            let mut stmt = tx.prepare(
                "SELECT id, created_at, next_attempt_at, attempt_count, status, payload, last_error
                 FROM queue
                 WHERE status = 'QUEUED' AND next_attempt_at <= ?1
                 ORDER BY id
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit as i64], row_to_entry)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for entry in &mut entries {
            tx.execute(
                "UPDATE queue SET status = 'INFLIGHT', next_attempt_at = ?1 WHERE id = ?2",
                params![now, entry.id],
            )?;
            entry.status = EntryStatus::Inflight;
        }

        tx.commit()?;
        Ok(entries)
    }

    /// Mark entries delivered
    pub fn mark_done(&self, ids: &[i64]) -> Result<(), StoreError> {
        let conn = self.lock();
        for id in ids {
            conn.execute("UPDATE queue SET status = 'DONE', last_error = NULL WHERE id = ?1", params![id])?;
        }
        Ok(())
    }

    /// Return an entry to the queue after a retryable failure
    pub fn reschedule(
        &self,
        id: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE queue
             SET status = 'QUEUED',
                 attempt_count = attempt_count + 1,
                 next_attempt_at = ?1,
                 last_error = ?2
             WHERE id = ?3",
            params![next_attempt_at.timestamp_millis(), error, id],
        )?;
        Ok(())
    }

    /// Quarantine an entry after a permanent failure or exhausted retries
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE queue
             SET status = 'FAILED',
                 attempt_count = attempt_count + 1,
                 last_error = ?1
             WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    /// Return INFLIGHT entries claimed longer than `older_than` ago to
    /// the queue. Run at startup and after a worker stops.
    pub fn reclaim_inflight(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let changed = self.lock().execute(
            "UPDATE queue SET status = 'QUEUED'
             WHERE status = 'INFLIGHT' AND next_attempt_at <= ?1",
            params![cutoff],
        )?;
        if changed > 0 {
            warn!(count = changed, "reclaimed stale in-flight queue entries");
        }
        Ok(changed as u64)
    }

    /// Delete DONE entries older than the retention window
    pub fn vacuum_done(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now().timestamp_millis() - retention.as_millis() as i64;
        let deleted = self.lock().execute(
            "DELETE FROM queue WHERE status = 'DONE' AND created_at <= ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            debug!(count = deleted, "vacuumed delivered queue entries");
        }
        Ok(deleted as u64)
    }

    // ------------------------------------------------------------------
    // Inspection and maintenance
    // ------------------------------------------------------------------

    /// Row counts by status
    pub fn stats(&self) -> Result<QueueStats, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match EntryStatus::parse(&status) {
                Some(EntryStatus::Queued) => stats.queued = count as u64,
                Some(EntryStatus::Inflight) => stats.inflight = count as u64,
                Some(EntryStatus::Failed) => stats.failed = count as u64,
                Some(EntryStatus::Done) => stats.done = count as u64,
                None => warn!(status, "unknown queue entry status"),
            }
        }
        Ok(stats)
    }

    /// Entries not yet resolved (QUEUED or INFLIGHT)
    pub fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM queue WHERE status IN ('QUEUED', 'INFLIGHT')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Number of quarantined entries
    pub fn failed_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM queue WHERE status = 'FAILED'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Projection of FAILED entries, oldest first
    pub fn list_failed(&self, limit: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, created_at, next_attempt_at, attempt_count, status, payload, last_error
             FROM queue WHERE status = 'FAILED' ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Reset FAILED entries (all, or the given ids) back to QUEUED with
    /// a fresh attempt budget
    pub fn requeue_failed(&self, ids: Option<&[i64]>) -> Result<u64, StoreError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock();
        let changed = match ids {
            Some(ids) => {
                let mut changed = 0;
                for id in ids {
                    changed += conn.execute(
                        "UPDATE queue
                         SET status = 'QUEUED', attempt_count = 0,
                             next_attempt_at = ?1, last_error = NULL
                         WHERE id = ?2 AND status = 'FAILED'",
                        params![now, id],
                    )?;
                }
                changed
            }
            None => conn.execute(
                "UPDATE queue
                 SET status = 'QUEUED', attempt_count = 0,
                     next_attempt_at = ?1, last_error = NULL
                 WHERE status = 'FAILED'",
                params![now],
            )?,
        };
        Ok(changed as u64)
    }

    /// Hard-delete FAILED entries (all, or the given ids)
    pub fn purge_failed(&self, ids: Option<&[i64]>) -> Result<u64, StoreError> {
        let conn = self.lock();
        let deleted = match ids {
            Some(ids) => {
                let mut deleted = 0;
                for id in ids {
                    deleted += conn.execute(
                        "DELETE FROM queue WHERE id = ?1 AND status = 'FAILED'",
                        params![id],
                    )?;
                }
                deleted
            }
            None => conn.execute("DELETE FROM queue WHERE status = 'FAILED'", [])?,
        };
        Ok(deleted as u64)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let status: String = row.get(4)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        created_at: millis_to_datetime(row.get(1)?),
        next_attempt_at: millis_to_datetime(row.get(2)?),
        attempt_count: row.get::<_, i64>(3)? as u32,
        status: EntryStatus::parse(&status).unwrap_or(EntryStatus::Failed),
        payload: row.get(5)?,
        last_error: row.get(6)?,
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}
