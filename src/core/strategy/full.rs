use std::io;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::BackupStrategy;
use crate::core::copier::SourceFile;

/// Copies every file found under the source root, unconditionally.
pub struct FullBackup;

#[async_trait]
impl BackupStrategy for FullBackup {
    async fn select(
        &self,
        scan: &[SourceFile],
        _source: &Path,
        _target: &Path,
        _last_run: Option<DateTime<Utc>>,
    ) -> io::Result<Vec<SourceFile>> {
        Ok(scan.to_vec())
    }
}
