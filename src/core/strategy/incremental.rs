use std::io;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::BackupStrategy;
use crate::core::copier::SourceFile;

/// Copies only what changed since the job's last completed run.
///
/// A file is a candidate when its modification time is newer than the last
/// completed run, or when it is missing at the destination (covering files
/// deleted from the backup and runs that never completed). A job that has
/// never completed copies everything.
pub struct IncrementalBackup;

#[async_trait]
impl BackupStrategy for IncrementalBackup {
    async fn select(
        &self,
        scan: &[SourceFile],
        source: &Path,
        target: &Path,
        last_run: Option<DateTime<Utc>>,
    ) -> io::Result<Vec<SourceFile>> {
        let Some(last_run) = last_run else {
            return Ok(scan.to_vec());
        };
        let threshold = SystemTime::from(last_run);

        let mut selected = Vec::new();
        for file in scan {
            if file.modified > threshold {
                selected.push(file.clone());
                continue;
            }
            let Ok(relative) = file.path.strip_prefix(source) else {
                continue;
            };
            if tokio::fs::metadata(target.join(relative)).await.is_err() {
                selected.push(file.clone());
            }
        }
        debug!(
            scanned = scan.len(),
            selected = selected.len(),
            "incremental selection"
        );
        Ok(selected)
    }
}
