//! The `state.json` status file.
//!
//! One entry per job, rewritten in full on every update so external tools
//! always read a consistent document. A single async lock serializes the
//! read-modify-write cycle across all writers in the process. A missing or
//! corrupt file is treated as empty rather than an error; the daemon must
//! come up even if the file was hand-edited into garbage.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::JobState;

pub const STATE_FILE: &str = "state.json";

/// Durable snapshot of one job's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub name: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub state: JobState,
    pub total_files: u64,
    pub total_bytes: u64,
    pub files_remaining: u64,
    pub progress: u8,
    pub last_run: Option<DateTime<Utc>>,
}

impl StatusEntry {
    /// A fresh entry for a job that has never run.
    pub fn new(name: &str, source: &Path, target: &Path) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            state: JobState::Ready,
            total_files: 0,
            total_bytes: 0,
            files_remaining: 0,
            progress: 0,
            last_run: None,
        }
    }
}

pub struct StatusStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StatusStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(STATE_FILE),
            lock: Mutex::new(()),
        }
    }

    /// All persisted entries, in file order.
    pub async fn read_all(&self) -> Vec<StatusEntry> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn get(&self, name: &str) -> Option<StatusEntry> {
        let _guard = self.lock.lock().await;
        self.load().await.into_iter().find(|e| e.name == name)
    }

    /// Inserts or replaces the entry for `entry.name`.
    pub async fn upsert(&self, entry: StatusEntry) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        match entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.flush(&entries).await
    }

    /// Updates just the state and progress of an existing entry. A missing
    /// entry is ignored; the job may have been deleted concurrently.
    pub async fn set_state(&self, name: &str, state: JobState, progress: u8) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.name == name) {
            entry.state = state;
            entry.progress = progress;
            self.flush(&entries).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        let before = entries.len();
        entries.retain(|e| e.name != name);
        if entries.len() != before {
            self.flush(&entries).await?;
        }
        Ok(())
    }

    /// Drops entries whose job is no longer part of `live`. Returns how many
    /// were removed.
    pub async fn prune(&self, live: &[String]) -> io::Result<usize> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        let before = entries.len();
        entries.retain(|e| live.contains(&e.name));
        let removed = before - entries.len();
        if removed > 0 {
            info!(removed, "pruned status entries for removed jobs");
            self.flush(&entries).await?;
        }
        Ok(removed)
    }

    async fn load(&self) -> Vec<StatusEntry> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not read status file");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "status file is corrupt, starting from an empty one"
                );
                Vec::new()
            }
        }
    }

    async fn flush(&self, entries: &[StatusEntry]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(entries).map_err(io::Error::other)?;
        tokio::fs::write(&self.path, body).await
    }
}
