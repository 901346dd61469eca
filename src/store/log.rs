//! Daily transfer logs (`log_<YYYY-MM-DD>.json`).
//!
//! Every file a run copies appends one entry to the current day's log. The
//! day boundary follows local time, matching the operator's calendar. Like
//! the status file, each log is rewritten as a whole JSON array under a
//! process-wide lock; a corrupt log is abandoned and restarted empty instead
//! of taking the daemon down.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

/// One transferred file.
///
/// `encrypt_ms` carries the encryption collaborator's result: elapsed
/// milliseconds when it succeeded, 0 when the file was not encrypted, and the
/// collaborator's negative error code on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub job: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub size_bytes: u64,
    pub transfer_ms: u64,
    pub encrypt_ms: i64,
    pub files_in_run: u64,
}

pub struct LogStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl LogStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Appends one entry to today's log file.
    pub async fn append(&self, entry: LogEntry) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.file_for(Local::now().date_naive());
        let mut entries = self.load(&path).await;
        entries.push(entry);
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_string_pretty(&entries).map_err(io::Error::other)?;
        tokio::fs::write(&path, body).await
    }

    /// All entries logged on `date`, in append order.
    pub async fn read_day(&self, date: NaiveDate) -> Vec<LogEntry> {
        let _guard = self.lock.lock().await;
        let path = self.file_for(date);
        self.load(&path).await
    }

    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("log_{}.json", date.format("%Y-%m-%d")))
    }

    async fn load(&self, path: &Path) -> Vec<LogEntry> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read transfer log");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "transfer log is corrupt, starting a fresh one"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(job: &str, source: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            job: job.to_string(),
            source: PathBuf::from(source),
            target: PathBuf::from("/t/f"),
            size_bytes: 10,
            transfer_ms: 3,
            encrypt_ms: 0,
            files_in_run: 1,
        }
    }

    #[tokio::test]
    async fn test_append_accumulates_in_order() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());
        store.append(entry("docs", "/s/a.txt")).await.unwrap();
        store.append(entry("docs", "/s/b.txt")).await.unwrap();
        store.append(entry("media", "/s/c.bin")).await.unwrap();

        let today = Local::now().date_naive();
        let entries = store.read_day(today).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].source, PathBuf::from("/s/a.txt"));
        assert_eq!(entries[1].source, PathBuf::from("/s/b.txt"));
        assert_eq!(entries[2].job, "media");
    }

    #[tokio::test]
    async fn test_file_name_carries_the_date() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            store.file_for(date),
            dir.path().join("log_2024-03-07.json")
        );
    }

    #[tokio::test]
    async fn test_missing_day_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert!(store.read_day(date).await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_log_restarts_empty() {
        let dir = TempDir::new().unwrap();
        let store = LogStore::new(dir.path());
        let today = Local::now().date_naive();
        std::fs::write(store.file_for(today), b"[{broken").unwrap();

        assert!(store.read_day(today).await.is_empty());
        store.append(entry("docs", "/s/a.txt")).await.unwrap();
        assert_eq!(store.read_day(today).await.len(), 1);
    }
}
