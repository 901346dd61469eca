//! Cross-job coordination of priority files.
//!
//! Certain extensions (contracts, invoices, whatever the operator deems
//! critical) must be safely copied before ANY job settles into bulk copying.
//! Every active run registers its pending priority files here; a run may only
//! copy non-priority files while no other run still has priority files
//! outstanding. A run that itself holds pending priority files is exempt,
//! otherwise nobody could ever drain the backlog.
//!
//! Blocked runs wake on a [`Notify`] signal when a record drains or a run
//! deregisters, with a poll interval as a fallback so a missed wakeup can
//! only delay a run, never wedge it.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use super::copier;

#[derive(Debug, Default)]
struct PriorityRecord {
    /// True while the run still has priority files left to copy.
    has_pending: bool,
    /// Set once the run finished its priority phase.
    processing_started: bool,
    /// Priority paths not yet copied in this run.
    remaining: HashSet<PathBuf>,
    /// Every priority path accounted for: the opening scan's matches, copied
    /// or not, plus recheck discoveries. Rechecks only report paths outside
    /// this set.
    seen: HashSet<PathBuf>,
}

pub struct PriorityCoordinator {
    records: Mutex<HashMap<String, PriorityRecord>>,
    changed: Notify,
    poll: Duration,
}

impl PriorityCoordinator {
    /// `poll` bounds how long a blocked run waits before re-evaluating even
    /// without a wakeup signal.
    pub fn new(poll: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            poll,
        }
    }

    /// Registers a starting run with the priority files it intends to copy
    /// and every priority path its opening scan observed. An incremental run
    /// observes more than it copies; without the full observed set, rechecks
    /// would rediscover unchanged files and copy them again.
    /// Replaces any stale record left by a previous run of the same job.
    pub fn register_run(
        &self,
        job: &str,
        pending: impl IntoIterator<Item = PathBuf>,
        observed: impl IntoIterator<Item = PathBuf>,
    ) {
        let remaining: HashSet<PathBuf> = pending.into_iter().collect();
        let mut seen: HashSet<PathBuf> = observed.into_iter().collect();
        seen.extend(remaining.iter().cloned());
        let count = remaining.len();
        let mut records = self.records.lock().expect("coordinator lock poisoned");
        records.insert(
            job.to_string(),
            PriorityRecord {
                has_pending: count > 0,
                processing_started: false,
                seen,
                remaining,
            },
        );
        debug!(job, pending = count, "run registered for priority coordination");
    }

    /// Whether `job` may copy a non-priority file right now.
    ///
    /// A run with its own priority backlog may proceed regardless (it is the
    /// one expected to drain it); otherwise every registered run must be
    /// clear of pending priority files.
    pub fn can_process_plain_files(&self, job: &str) -> bool {
        let records = self.records.lock().expect("coordinator lock poisoned");
        if records.get(job).is_some_and(|r| r.has_pending) {
            return true;
        }
        !records.values().any(|r| r.has_pending)
    }

    /// Marks the transition out of the priority phase.
    pub fn mark_processing_started(&self, job: &str) {
        let mut records = self.records.lock().expect("coordinator lock poisoned");
        if let Some(record) = records.get_mut(job) {
            record.processing_started = true;
        }
    }

    /// Records one priority file as copied. When the run's last pending
    /// priority file is gone, blocked runs are woken.
    pub fn mark_priority_copied(&self, job: &str, path: &Path) {
        let drained = {
            let mut records = self.records.lock().expect("coordinator lock poisoned");
            match records.get_mut(job) {
                Some(record) => {
                    record.remaining.remove(path);
                    if record.remaining.is_empty() && record.has_pending {
                        record.has_pending = false;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if drained {
            debug!(job, "priority backlog drained");
            self.changed.notify_waiters();
        }
    }

    /// Re-scans the source tree for priority files that appeared after the
    /// run registered. Newly discovered paths are added to the run's pending
    /// set and returned for immediate copying.
    pub async fn recheck_run(
        &self,
        job: &str,
        source: &Path,
        extensions: &[String],
    ) -> io::Result<Vec<PathBuf>> {
        let scan = copier::scan_source(source).await?;
        let mut records = self.records.lock().expect("coordinator lock poisoned");
        let Some(record) = records.get_mut(job) else {
            return Ok(Vec::new());
        };
        let mut fresh = Vec::new();
        for file in scan {
            if copier::extension_matches(&file.path, extensions)
                && record.seen.insert(file.path.clone())
            {
                record.remaining.insert(file.path.clone());
                fresh.push(file.path);
            }
        }
        if !fresh.is_empty() {
            record.has_pending = true;
            debug!(job, count = fresh.len(), "priority files appeared mid-run");
        }
        Ok(fresh)
    }

    /// Drops the run's record, releasing anything it was blocking. Called on
    /// every run exit, successful or not.
    pub fn unregister_run(&self, job: &str) {
        let removed = self
            .records
            .lock()
            .expect("coordinator lock poisoned")
            .remove(job)
            .is_some();
        if removed {
            self.changed.notify_waiters();
        }
    }

    /// Parks the caller until coordination state may have changed, or the
    /// poll interval elapses.
    pub async fn wait_for_change(&self) {
        let _ = tokio::time::timeout(self.poll, self.changed.notified()).await;
    }

    /// Whether `job` currently has pending priority files registered.
    pub fn has_pending_priority(&self, job: &str) -> bool {
        self.records
            .lock()
            .expect("coordinator lock poisoned")
            .get(job)
            .is_some_and(|r| r.has_pending)
    }
}
