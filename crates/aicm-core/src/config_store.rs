//! Shared on-disk configuration store.
//!
//! A small, human-editable INI file holds cross-invocation state: the
//! `[tracker]` section carries connection settings and the
//! `[triggered_limits]` section carries the last limit set received from
//! the server. The file may be shared by several trackers in one process
//! and by several processes at once, so every read-modify-write sequence
//! runs under an exclusive advisory lock on a sidecar `.lock` file and
//! every write goes through a temp-file-then-rename cycle.

use crate::error::ConfigError;
use fs2::FileExt;
use rand::RngExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "config_store_tests.rs"]
mod tests;

/// Maximum rename attempts for an atomic write
const RENAME_ATTEMPTS: u32 = 3;

/// Base sleep between rename attempts; jittered up to 2x
const RENAME_BACKOFF: Duration = Duration::from_millis(10);

// ============================================================================
// INI Document
// ============================================================================

/// Parsed form of the configuration file.
///
/// Sections and keys are kept sorted so that rendering is deterministic
/// regardless of the order edits were applied in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniDocument {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse INI text tolerantly.
    ///
    /// Duplicate sections are merged with later values winning, unknown
    /// sections pass through untouched, and malformed lines are dropped
    /// with a warning. Lines before the first section header have no home
    /// and are dropped as well.
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::new();
        let mut current: Option<String> = None;

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim();
                if name.is_empty() {
                    warn!(line = line_no + 1, "dropping empty section header");
                    current = None;
                    continue;
                }
                doc.sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!(line = line_no + 1, "dropping malformed config line");
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                warn!(line = line_no + 1, "dropping config line with empty key");
                continue;
            }

            match current {
                Some(ref section) => {
                    doc.sections
                        .entry(section.clone())
                        .or_default()
                        .insert(key.to_string(), value.trim().to_string());
                }
                None => {
                    warn!(line = line_no + 1, "dropping config line outside any section");
                }
            }
        }

        doc
    }

    /// Render the document back to INI text
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, entries) in &self.sections {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", name));
            for (key, value) in entries {
                out.push_str(&format!("{}={}\n", key, value));
            }
        }
        out
    }

    /// Get a single value
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    /// Set a single value, creating the section if needed
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Get a copy of an entire section; empty if absent
    pub fn section(&self, section: &str) -> BTreeMap<String, String> {
        self.sections.get(section).cloned().unwrap_or_default()
    }

    /// Replace an entire section wholesale
    pub fn replace_section(&mut self, section: &str, mapping: BTreeMap<String, String>) {
        self.sections.insert(section.to_string(), mapping);
    }

    /// List section names
    pub fn section_names(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }
}

// ============================================================================
// ConfigStore
// ============================================================================

/// Locked, atomically-written configuration file.
///
/// The store itself is stateless: each operation re-reads the file so
/// that updates from other processes are always observed. Read errors
/// degrade to an empty document; write errors surface as
/// [`ConfigError::Persist`] and may be retried by the caller.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ConfigStore {
    /// Create a store for the given file path.
    ///
    /// Neither the file nor its directory need exist yet; both are
    /// created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "aicm.ini".to_string());
        lock_name.push_str(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document.
    ///
    /// A missing or unreadable file yields an empty document; corruption
    /// is handled line-by-line by the tolerant parser.
    pub fn load(&self) -> IniDocument {
        match fs::read_to_string(&self.path) {
            Ok(text) => IniDocument::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => IniDocument::new(),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read configuration file, treating as empty"
                );
                IniDocument::new()
            }
        }
    }

    /// Get a single value without taking the lock.
    ///
    /// Plain reads never need the advisory lock: the atomic rename on the
    /// write side guarantees a reader always sees a complete file.
    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.load().get(section, key).map(String::from)
    }

    /// Get a copy of an entire section without taking the lock
    pub fn get_section(&self, section: &str) -> BTreeMap<String, String> {
        self.load().section(section)
    }

    /// Set a single value under the advisory lock
    pub fn set(
        &self,
        section: &str,
        key: &str,
        value: impl Into<String>,
    ) -> Result<(), ConfigError> {
        let value = value.into();
        self.with_lock(|doc| doc.set(section, key, value))
    }

    /// Replace an entire section under the advisory lock
    pub fn replace_section(
        &self,
        section: &str,
        mapping: BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        self.with_lock(|doc| doc.replace_section(section, mapping))
    }

    /// Run a read-modify-write sequence under the advisory file lock.
    ///
    /// The callback receives the freshly-loaded document and may mutate it
    /// freely; the result is written back atomically before the lock is
    /// released. The lock spans only the critical section: callers must
    /// not perform network I/O inside the callback.
    pub fn with_lock<T>(&self, f: impl FnOnce(&mut IniDocument) -> T) -> Result<T, ConfigError> {
        let lock = self.acquire_lock()?;

        let mut doc = self.load();
        let result = f(&mut doc);
        self.write_atomic(&doc)?;

        drop(lock);
        Ok(result)
    }

    /// Acquire the exclusive advisory lock on the sidecar lock file.
    ///
    /// The lock is released when the returned handle is dropped.
    fn acquire_lock(&self) -> Result<File, ConfigError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Lock {
                path: self.lock_path.display().to_string(),
                message: format!("failed to create lock directory: {}", e),
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| ConfigError::Lock {
                path: self.lock_path.display().to_string(),
                message: format!("failed to open lock file: {}", e),
            })?;

        file.lock_exclusive().map_err(|e| ConfigError::Lock {
            path: self.lock_path.display().to_string(),
            message: format!("failed to acquire exclusive lock: {}", e),
        })?;

        Ok(file)
    }

    /// Write the document atomically: temp file, fsync, rename.
    fn write_atomic(&self, doc: &IniDocument) -> Result<(), ConfigError> {
        let persist_err = |message: String| ConfigError::Persist {
            path: self.path.display().to_string(),
            message,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| persist_err(format!("failed to create directory: {}", e)))?;
        }

        let tmp_path = self.tmp_path();
        let mut file = File::create(&tmp_path)
            .map_err(|e| persist_err(format!("failed to create temp file: {}", e)))?;
        file.write_all(doc.render().as_bytes())
            .map_err(|e| persist_err(format!("failed to write temp file: {}", e)))?;
        file.sync_all()
            .map_err(|e| persist_err(format!("failed to sync temp file: {}", e)))?;
        drop(file);

        // Rename can transiently fail on some filesystems while another
        // process holds the destination open; retry with a short jittered
        // sleep before giving up.
        let mut last_error = None;
        for attempt in 1..=RENAME_ATTEMPTS {
            match fs::rename(&tmp_path, &self.path) {
                Ok(()) => {
                    debug!(path = %self.path.display(), "configuration written");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < RENAME_ATTEMPTS {
                        let jitter = rand::rng().random_range(1.0..=2.0);
                        std::thread::sleep(RENAME_BACKOFF.mul_f64(jitter));
                    }
                }
            }
        }

        let _ = fs::remove_file(&tmp_path);
        Err(persist_err(format!(
            "rename failed after {} attempts: {}",
            RENAME_ATTEMPTS,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "aicm.ini".to_string());
        name.push_str(".tmp");
        self.path.with_file_name(name)
    }
}
