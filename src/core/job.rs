use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Errors produced by job management and backup runs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job name must not be empty")]
    EmptyName,

    #[error("a job named '{0}' already exists")]
    DuplicateName(String),

    #[error("no job named '{0}'")]
    UnknownJob(String),

    #[error("source directory does not exist: {}", .0.display())]
    MissingSource(PathBuf),

    #[error("job '{0}' has a run in progress")]
    Busy(String),

    #[error("business software '{0}' is running")]
    Blocked(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("transfer of {} failed: {source}", .path.display())]
    Transfer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encryption of {} failed with code {code}", .path.display())]
    Encrypt { path: PathBuf, code: i64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Full,
    Incremental,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Full => "FULL",
            JobKind::Incremental => "INCREMENTAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Ready,
    Running,
    Paused,
    PausedForPriority,
    Stopped,
    Completed,
    Error,
}

impl JobState {
    /// True while a run task owns the job.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Running | JobState::Paused | JobState::PausedForPriority
        )
    }
}

/// Per-run control handles, replaced wholesale when a new run begins.
///
/// The pause channel doubles as a gate: `true` means the run may proceed,
/// `false` parks it at the next checkpoint. Cancellation is sticky for the
/// lifetime of the run. `generation` identifies the run the handles belong
/// to, so a task still unwinding from a stopped run cannot act on state
/// that meanwhile passed to its successor.
struct RunControl {
    generation: u64,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

impl RunControl {
    fn new() -> Self {
        let (pause, _) = watch::channel(true);
        Self {
            generation: 0,
            cancel: CancellationToken::new(),
            pause,
        }
    }
}

/// Capability for driving one claimed run.
///
/// Handed out by [`BackupJob::begin_run`] and threaded through the run task.
/// It keeps the pause receiver alive for the whole run, so a pause sent
/// while the task is deep inside a file copy is retained until the next
/// checkpoint reads the gate.
pub(crate) struct RunHandle {
    generation: u64,
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
}

impl RunHandle {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cooperative yield point called between steps of a run.
    ///
    /// Returns `Err(Cancelled)` once the run has been stopped. If the job is
    /// paused, waits until it is resumed, then re-checks cancellation so a
    /// stop issued while parked still wins.
    pub(crate) async fn checkpoint(&mut self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        while !*self.pause.borrow_and_update() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(JobError::Cancelled),
                changed = self.pause.changed() => {
                    if changed.is_err() {
                        return Err(JobError::Cancelled);
                    }
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }
}

/// A named backup job and its lifecycle state.
///
/// The job itself is passive; the manager spawns a run task that drives the
/// copy sequence and polls [`RunHandle::checkpoint`] between steps. All state
/// transitions go through the compare-and-set helpers below so that concurrent
/// control commands cannot leave the job in an inconsistent state.
pub struct BackupJob {
    name: String,
    source: PathBuf,
    target: PathBuf,
    kind: JobKind,
    state: Mutex<JobState>,
    progress: AtomicU8,
    control: Mutex<RunControl>,
}

/// Point-in-time copy of a job's externally visible fields.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub name: String,
    pub kind: JobKind,
    pub source: PathBuf,
    pub target: PathBuf,
    pub state: JobState,
    pub progress: u8,
}

impl BackupJob {
    pub fn new(name: &str, source: &Path, target: &Path, kind: JobKind) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            kind,
            state: Mutex::new(JobState::Ready),
            progress: AtomicU8::new(0),
            control: Mutex::new(RunControl::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().expect("job state lock poisoned")
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Records run progress, ignored when `generation` is not the current
    /// run's. Keeps a superseded task from overwriting its successor's
    /// percentage.
    pub(crate) fn set_progress(&self, generation: u64, percent: u8) {
        let control = self.control.lock().expect("job control lock poisoned");
        if control.generation == generation {
            self.progress.store(percent, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            source: self.source.clone(),
            target: self.target.clone(),
            state: self.state(),
            progress: self.progress(),
        }
    }

    /// Moves the job to `to` if its current state is listed in `from`.
    pub(crate) fn transition(&self, from: &[JobState], to: JobState) -> bool {
        let mut state = self.state.lock().expect("job state lock poisoned");
        if from.contains(&state) {
            *state = to;
            true
        } else {
            false
        }
    }

    /// Claims the job for a new run: resets progress, installs fresh
    /// cancellation and pause handles and bumps the run generation. Returns
    /// `None` if a run already owns the job.
    pub(crate) fn begin_run(&self) -> Option<RunHandle> {
        let mut state = self.state.lock().expect("job state lock poisoned");
        if state.is_active() {
            return None;
        }
        *state = JobState::Running;
        let mut control = self.control.lock().expect("job control lock poisoned");
        let (pause_tx, pause_rx) = watch::channel(true);
        control.generation += 1;
        control.cancel = CancellationToken::new();
        control.pause = pause_tx;
        self.progress.store(0, Ordering::Relaxed);
        Some(RunHandle {
            generation: control.generation,
            cancel: control.cancel.clone(),
            pause: pause_rx,
        })
    }

    /// Terminal transition used by the run task itself. Refused when the
    /// handle's run has been superseded by a newer one.
    pub(crate) fn finish(&self, handle: &RunHandle, to: JobState) -> bool {
        let mut state = self.state.lock().expect("job state lock poisoned");
        let control = self.control.lock().expect("job control lock poisoned");
        if control.generation != handle.generation || !state.is_active() {
            return false;
        }
        *state = to;
        true
    }

    /// True while `handle` still belongs to the job's current run.
    pub(crate) fn owns_run(&self, handle: &RunHandle) -> bool {
        self.control
            .lock()
            .expect("job control lock poisoned")
            .generation
            == handle.generation
    }

    /// Closes the pause gate. Only meaningful while a run is active.
    pub(crate) fn pause(&self) -> bool {
        let mut state = self.state.lock().expect("job state lock poisoned");
        if !matches!(*state, JobState::Running | JobState::PausedForPriority) {
            return false;
        }
        *state = JobState::Paused;
        let control = self.control.lock().expect("job control lock poisoned");
        control.pause.send_replace(false);
        true
    }

    /// Reopens the pause gate for a user-paused run.
    pub(crate) fn resume(&self) -> bool {
        let mut state = self.state.lock().expect("job state lock poisoned");
        if *state != JobState::Paused {
            return false;
        }
        *state = JobState::Running;
        let control = self.control.lock().expect("job control lock poisoned");
        control.pause.send_replace(true);
        true
    }

    /// Cancels the active run. The run task observes this at its next
    /// checkpoint; a run parked on the pause gate is woken into cancellation.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.state.lock().expect("job state lock poisoned");
        if !state.is_active() {
            return false;
        }
        *state = JobState::Stopped;
        let control = self.control.lock().expect("job control lock poisoned");
        control.cancel.cancel();
        control.pause.send_replace(true);
        self.progress.store(0, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn job() -> BackupJob {
        BackupJob::new(
            "docs",
            Path::new("/tmp/src"),
            Path::new("/tmp/dst"),
            JobKind::Full,
        )
    }

    #[test]
    fn test_new_job_is_ready() {
        let job = job();
        assert_eq!(job.state(), JobState::Ready);
        assert_eq!(job.progress(), 0);
    }

    #[test]
    fn test_begin_run_claims_job_once() {
        let job = job();
        assert!(job.begin_run().is_some());
        assert_eq!(job.state(), JobState::Running);
        assert!(job.begin_run().is_none());
    }

    #[test]
    fn test_begin_run_restarts_from_terminal_states() {
        let job = job();
        let handle = job.begin_run().expect("fresh job was not claimable");
        assert!(job.finish(&handle, JobState::Completed));
        job.set_progress(handle.generation(), 100);
        assert!(job.begin_run().is_some());
        assert_eq!(job.progress(), 0);
    }

    #[test]
    fn test_pause_applies_only_to_active_runs() {
        let job = job();
        assert!(!job.pause());
        let _handle = job.begin_run().expect("fresh job was not claimable");
        assert!(job.pause());
        assert_eq!(job.state(), JobState::Paused);
        assert!(!job.pause());
        assert!(job.resume());
        assert_eq!(job.state(), JobState::Running);
    }

    #[test]
    fn test_stop_resets_progress() {
        let job = job();
        let handle = job.begin_run().expect("fresh job was not claimable");
        job.set_progress(handle.generation(), 42);
        assert!(job.stop());
        assert_eq!(job.state(), JobState::Stopped);
        assert_eq!(job.progress(), 0);
        assert!(!job.stop());
    }

    #[tokio::test]
    async fn test_checkpoint_passes_while_running() {
        let job = job();
        let mut handle = job.begin_run().expect("fresh job was not claimable");
        assert!(handle.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn test_checkpoint_fails_after_stop() {
        let job = job();
        let mut handle = job.begin_run().expect("fresh job was not claimable");
        job.stop();
        assert!(matches!(handle.checkpoint().await, Err(JobError::Cancelled)));
    }

    #[tokio::test]
    async fn test_checkpoint_parks_until_resume() {
        let job = Arc::new(job());
        let mut handle = job.begin_run().expect("fresh job was not claimable");
        job.pause();

        let parked = tokio::spawn(async move { handle.checkpoint().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished());

        job.resume();
        let result = timeout(Duration::from_secs(1), parked)
            .await
            .expect("checkpoint did not wake on resume")
            .expect("checkpoint task panicked");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_pause_between_checkpoints_parks_the_next_one() {
        let job = Arc::new(job());
        let mut handle = job.begin_run().expect("fresh job was not claimable");
        assert!(handle.checkpoint().await.is_ok());

        // The pause lands while the run is busy inside a copy, with nothing
        // waiting on the gate yet.
        job.pause();

        let parked = tokio::spawn(async move { handle.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished());

        job.resume();
        let result = timeout(Duration::from_secs(1), parked)
            .await
            .expect("checkpoint did not wake on resume")
            .expect("checkpoint task panicked");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stop_wakes_parked_checkpoint_into_cancellation() {
        let job = Arc::new(job());
        let mut handle = job.begin_run().expect("fresh job was not claimable");
        job.pause();

        let parked = tokio::spawn(async move { handle.checkpoint().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        job.stop();
        let result = timeout(Duration::from_secs(1), parked)
            .await
            .expect("checkpoint did not wake on stop")
            .expect("checkpoint task panicked");
        assert!(matches!(result, Err(JobError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_touch_a_restarted_job() {
        let job = job();
        let mut old = job.begin_run().expect("fresh job was not claimable");
        job.stop();

        let mut current = job.begin_run().expect("stopped job was not claimable");
        assert!(matches!(old.checkpoint().await, Err(JobError::Cancelled)));
        assert!(current.checkpoint().await.is_ok());

        // The superseded task can move neither the state nor the progress.
        assert!(!job.finish(&old, JobState::Completed));
        job.set_progress(old.generation(), 55);
        assert_eq!(job.state(), JobState::Running);
        assert_eq!(job.progress(), 0);
        assert!(!job.owns_run(&old));

        assert!(job.finish(&current, JobState::Completed));
    }
}
