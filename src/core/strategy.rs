//! Backup strategies and the run driver.
//!
//! A strategy only decides WHICH files a run copies; everything else is
//! shared. The driver owns the full sequence: scan, candidate selection,
//! priority registration, the two copy phases, and the final status write.
//! Between steps it yields through the run handle's checkpoint so pause and
//! stop commands take effect at file boundaries.

pub mod full;
pub mod incremental;

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::store::{LogEntry, StatusEntry};

use super::copier::{self, SourceFile};
use super::events::JobEvent;
use super::gate::LargeFileGate;
use super::job::{BackupJob, JobError, JobKind, JobState, RunHandle};
use super::manager::JobManager;
use super::progress::ByteProgressTracker;

/// Candidate selection for one run.
#[async_trait]
pub trait BackupStrategy: Send + Sync {
    /// Filters the scanned source files down to the ones this run must copy.
    async fn select(
        &self,
        scan: &[SourceFile],
        source: &Path,
        target: &Path,
        last_run: Option<DateTime<Utc>>,
    ) -> io::Result<Vec<SourceFile>>;
}

pub fn for_kind(kind: JobKind) -> &'static dyn BackupStrategy {
    match kind {
        JobKind::Full => &full::FullBackup,
        JobKind::Incremental => &incremental::IncrementalBackup,
    }
}

/// Executes one run of `job` to completion, error, or cancellation.
///
/// The coordinator registration is always released on exit, whatever the
/// outcome, so a failed run can never leave other jobs blocked.
pub(crate) async fn execute_run(
    manager: &JobManager,
    job: &std::sync::Arc<BackupJob>,
    handle: &mut RunHandle,
) -> Result<(), JobError> {
    let span = info_span!(
        "backup_run",
        job = %job.name(),
        kind = job.kind().as_str(),
        run = %Uuid::now_v7(),
    );
    async {
        let result = drive(manager, job, handle).await;
        manager.coordinator().unregister_run(job.name());
        result
    }
    .instrument(span)
    .await
}

async fn drive(
    manager: &JobManager,
    job: &std::sync::Arc<BackupJob>,
    handle: &mut RunHandle,
) -> Result<(), JobError> {
    let config = manager.config();
    // The previous completed-run timestamp drives incremental selection and
    // must survive every status rewrite until this run completes.
    let last_run = manager
        .status()
        .get(job.name())
        .await
        .and_then(|entry| entry.last_run);

    let scan = copier::scan_source(job.source()).await?;
    let candidates = for_kind(job.kind())
        .select(&scan, job.source(), job.target(), last_run)
        .await?;
    // Priority files the selection skipped (unchanged since the last run)
    // still count as observed, so later rechecks do not rediscover them.
    let observed: Vec<_> = scan
        .iter()
        .filter(|f| copier::extension_matches(&f.path, &config.priority_extensions))
        .map(|f| f.path.clone())
        .collect();
    let (priority, plain): (Vec<SourceFile>, Vec<SourceFile>) = candidates
        .into_iter()
        .partition(|f| copier::extension_matches(&f.path, &config.priority_extensions));

    let total_files = (priority.len() + plain.len()) as u64;
    let total_bytes: u64 = priority.iter().chain(plain.iter()).map(|f| f.size).sum();
    info!(
        files = total_files,
        bytes = total_bytes,
        priority = priority.len(),
        "run planned"
    );

    manager
        .coordinator()
        .register_run(job.name(), priority.iter().map(|f| f.path.clone()), observed);

    let tracker = {
        let job = std::sync::Arc::clone(job);
        let events = manager.events();
        let generation = handle.generation();
        ByteProgressTracker::new(total_bytes, move |percent| {
            job.set_progress(generation, percent);
            let _ = events.send(JobEvent::Progress {
                name: job.name().to_string(),
                percent,
            });
        })
    };

    let mut run = Run {
        manager,
        job,
        handle,
        tracker,
        total_files,
        total_bytes,
        done: 0,
        last_run,
    };

    for file in &priority {
        run.copy_one(file).await?;
        manager
            .coordinator()
            .mark_priority_copied(job.name(), &file.path);
    }
    manager.coordinator().mark_processing_started(job.name());

    // Priority files may have appeared while this run was copying its own.
    run.absorb_fresh_priority().await?;

    let mut plain: VecDeque<SourceFile> = plain.into();
    while let Some(file) = plain.pop_front() {
        if !manager.coordinator().can_process_plain_files(job.name()) {
            run.wait_for_clearance().await?;
            run.absorb_fresh_priority().await?;
        }
        run.copy_one(&file).await?;
    }

    // A stop issued during the last copy still wins over completion.
    run.handle.checkpoint().await?;

    let completed_at = Utc::now();
    manager
        .status()
        .upsert(StatusEntry {
            name: job.name().to_string(),
            source: job.source().to_path_buf(),
            target: job.target().to_path_buf(),
            state: JobState::Completed,
            total_files,
            total_bytes,
            files_remaining: 0,
            progress: 100,
            last_run: Some(completed_at),
        })
        .await?;
    Ok(())
}

struct Run<'a> {
    manager: &'a JobManager,
    job: &'a std::sync::Arc<BackupJob>,
    handle: &'a mut RunHandle,
    tracker: ByteProgressTracker,
    total_files: u64,
    total_bytes: u64,
    done: u64,
    last_run: Option<DateTime<Utc>>,
}

impl Run<'_> {
    /// Copies one source file through the full per-file sequence:
    /// checkpoint, destination directories, status snapshot, checkpoint,
    /// copy under the large-file gate, encryption, transfer log.
    async fn copy_one(&mut self, file: &SourceFile) -> Result<(), JobError> {
        let config = self.manager.config();
        let job = self.job;

        self.handle.checkpoint().await?;

        let relative = file
            .path
            .strip_prefix(job.source())
            .map_err(|_| JobError::Transfer {
                path: file.path.clone(),
                source: io::Error::other("file escaped the source root"),
            })?;
        let dest = job.target().join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| JobError::Transfer {
                    path: dest.clone(),
                    source,
                })?;
        }

        self.write_snapshot().await?;
        self.handle.checkpoint().await?;

        let large = LargeFileGate::is_large(file.size, config.large_file_threshold_kb);
        let permit = if large {
            debug!(path = %file.path.display(), size = file.size, "waiting for large-transfer slot");
            loop {
                self.handle.checkpoint().await?;
                let cancel = self.handle.cancel_token();
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return Err(JobError::Cancelled),
                    permit = self.manager.gate().acquire() => permit,
                };
                // A pause that arrived during the wait must not keep the
                // single slot occupied while the run is parked.
                if job.state() == JobState::Paused {
                    drop(permit);
                    continue;
                }
                break Some(permit);
            }
        } else {
            None
        };

        let chunk_delay = (config.chunk_delay_ms > 0
            && file.size <= config.chunk_delay_max_kb.saturating_mul(1024))
        .then(|| Duration::from_millis(config.chunk_delay_ms));

        let started = Instant::now();
        let tracker = &mut self.tracker;
        let copied = copier::copy_with_progress(&file.path, &dest, chunk_delay, &mut |count| {
            tracker.add_copied_bytes(count)
        })
        .await
        .map_err(|source| JobError::Transfer {
            path: file.path.clone(),
            source,
        })?;
        let transfer_ms = started.elapsed().as_millis() as u64;
        drop(permit);

        let mut encrypt_ms = 0i64;
        if copier::extension_matches(&file.path, &config.encrypt_extensions) {
            encrypt_ms = self
                .manager
                .encryptor()
                .encrypt(&dest, &config.encrypt_key)
                .await;
        }

        self.append_log(file, &dest, copied, transfer_ms, encrypt_ms)
            .await?;

        if encrypt_ms < 0 {
            return Err(JobError::Encrypt {
                path: dest,
                code: encrypt_ms,
            });
        }

        self.done += 1;
        Ok(())
    }

    /// Parks the run while another job still has pending priority files.
    /// The transient wait is published as its own state so operators can see
    /// why the job is not progressing.
    async fn wait_for_clearance(&mut self) -> Result<(), JobError> {
        let job = self.job;
        loop {
            self.handle.checkpoint().await?;
            if self
                .manager
                .coordinator()
                .can_process_plain_files(job.name())
            {
                break;
            }
            if job.transition(&[JobState::Running], JobState::PausedForPriority) {
                debug!("waiting for another job's priority files");
                self.manager.publish_state(job).await;
            }
            let cancel = self.handle.cancel_token();
            tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::Cancelled),
                _ = self.manager.coordinator().wait_for_change() => {}
            }
        }
        if job.transition(&[JobState::PausedForPriority], JobState::Running) {
            self.manager.publish_state(job).await;
        }
        Ok(())
    }

    /// Re-checks the source for priority files that appeared mid-run and
    /// copies them ahead of any remaining plain files.
    async fn absorb_fresh_priority(&mut self) -> Result<(), JobError> {
        let extensions = self.manager.config().priority_extensions.clone();
        let fresh = self
            .manager
            .coordinator()
            .recheck_run(self.job.name(), self.job.source(), &extensions)
            .await?;
        for path in fresh {
            let file = match tokio::fs::metadata(&path).await {
                Ok(metadata) => SourceFile {
                    path: path.clone(),
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
                Err(err) => {
                    // Vanished between scan and copy; do not leave it
                    // registered or it would block other jobs forever.
                    warn!(path = %path.display(), error = %err, "fresh priority file disappeared");
                    self.manager
                        .coordinator()
                        .mark_priority_copied(self.job.name(), &path);
                    continue;
                }
            };
            self.copy_one(&file).await?;
            self.manager
                .coordinator()
                .mark_priority_copied(self.job.name(), &path);
        }
        Ok(())
    }

    /// Durable mid-run status: where the run is and how much is left.
    async fn write_snapshot(&self) -> io::Result<()> {
        let job = self.job;
        self.manager
            .status()
            .upsert(StatusEntry {
                name: job.name().to_string(),
                source: job.source().to_path_buf(),
                target: job.target().to_path_buf(),
                state: job.state(),
                total_files: self.total_files,
                total_bytes: self.total_bytes,
                files_remaining: self.total_files.saturating_sub(self.done),
                progress: job.progress(),
                last_run: self.last_run,
            })
            .await
    }

    async fn append_log(
        &self,
        file: &SourceFile,
        dest: &Path,
        size_bytes: u64,
        transfer_ms: u64,
        encrypt_ms: i64,
    ) -> io::Result<()> {
        self.manager
            .logs()
            .append(LogEntry {
                timestamp: Utc::now(),
                job: self.job.name().to_string(),
                source: file.path.clone(),
                target: dest.to_path_buf(),
                size_bytes,
                transfer_ms,
                encrypt_ms,
                files_in_run: self.total_files,
            })
            .await
    }
}
