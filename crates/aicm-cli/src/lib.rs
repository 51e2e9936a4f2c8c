//! # aicm-queue
//!
//! Operator tool for the durable delivery queue.
//!
//! Inspects a queue database while a tracker's worker is running
//! against it (reads open the file read-only; WAL permits the
//! concurrent reader), lists quarantined entries, and requeues or
//! purges them.
//!
//! Exit codes: 0 success, 1 usage error, 2 I/O error, 3 lock
//! contention.

use aicm_delivery::{QueueEntry, SqliteQueueStore, StoreError};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use thiserror::Error;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue maintenance for the AICM tracking SDK
#[derive(Debug, Parser)]
#[command(name = "aicm-queue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and repair the durable delivery queue")]
pub struct Cli {
    /// Path of the queue database
    #[arg(long, env = "AICM_DB_PATH")]
    pub db_path: PathBuf,

    /// Logging level
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available maintenance commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show entry counts by status
    Stats {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List quarantined entries
    ListFailed {
        /// Maximum entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Return quarantined entries to the queue with a fresh attempt
    /// budget
    Requeue {
        /// Entry ids to requeue; every failed entry when omitted
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
    },

    /// Hard-delete quarantined entries
    Purge {
        /// Entry ids to purge; every failed entry when omitted
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
    },
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

// ============================================================================
// Errors
// ============================================================================

/// CLI failures mapped onto process exit codes
#[derive(Debug, Error)]
pub enum CliError {
    /// Bad arguments or an unusable combination of them
    #[error("Usage error: {0}")]
    Usage(String),

    /// The queue database could not be read or written
    #[error(transparent)]
    Store(StoreError),

    /// Output could not be produced
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for CliError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl CliError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 1,
            Self::Store(e) if e.is_busy() => 3,
            Self::Store(_) => 2,
            Self::Io(_) => 2,
        }
    }
}

// ============================================================================
// Command Execution
// ============================================================================

/// Execute a parsed command line
pub fn run(cli: Cli) -> Result<(), CliError> {
    // Never create a queue file here: a typo'd path should fail, not
    // leave an empty database behind.
    if !cli.db_path.exists() {
        return Err(CliError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("queue database {} does not exist", cli.db_path.display()),
        )));
    }

    match cli.command {
        Commands::Stats { format } => {
            let store = SqliteQueueStore::open_read_only(&cli.db_path)?;
            let stats = store.stats()?;
            match format {
                OutputFormat::Text => {
                    println!("queued    {}", stats.queued);
                    println!("inflight  {}", stats.inflight);
                    println!("failed    {}", stats.failed);
                    println!("done      {}", stats.done);
                    println!("total     {}", stats.total());
                }
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "queued": stats.queued,
                            "inflight": stats.inflight,
                            "failed": stats.failed,
                            "done": stats.done,
                            "total": stats.total(),
                        })
                    );
                }
            }
            Ok(())
        }

        Commands::ListFailed { limit, format } => {
            if limit == 0 {
                return Err(CliError::Usage("--limit must be at least 1".to_string()));
            }
            let store = SqliteQueueStore::open_read_only(&cli.db_path)?;
            let failed = store.list_failed(limit)?;
            match format {
                OutputFormat::Text => {
                    if failed.is_empty() {
                        println!("no failed entries");
                    }
                    for entry in &failed {
                        println!("{}", describe_entry(entry));
                    }
                }
                OutputFormat::Json => {
                    let items: Vec<serde_json::Value> = failed
                        .iter()
                        .map(|entry| {
                            serde_json::json!({
                                "id": entry.id,
                                "created_at": entry.created_at.to_rfc3339(),
                                "attempt_count": entry.attempt_count,
                                "last_error": entry.last_error,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::Value::Array(items));
                }
            }
            Ok(())
        }

        Commands::Requeue { ids } => {
            let store = SqliteQueueStore::open(&cli.db_path)?;
            let changed = store.requeue_failed(id_filter(&ids))?;
            println!("requeued {} entries", changed);
            Ok(())
        }

        Commands::Purge { ids } => {
            let store = SqliteQueueStore::open(&cli.db_path)?;
            let deleted = store.purge_failed(id_filter(&ids))?;
            println!("purged {} entries", deleted);
            Ok(())
        }
    }
}

fn id_filter(ids: &[i64]) -> Option<&[i64]> {
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

fn describe_entry(entry: &QueueEntry) -> String {
    format!(
        "#{}  created {}  attempts {}  error: {}",
        entry.id,
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.attempt_count,
        entry.last_error.as_deref().unwrap_or("-")
    )
}
