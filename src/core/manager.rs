//! The job collection and its execution surface.
//!
//! All control paths (TCP commands, the business-software watcher, startup
//! job creation) go through the manager. It owns the shared run services,
//! spawns run tasks, and publishes every externally visible change on a
//! broadcast channel.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::{RwLock, Semaphore, broadcast};
use tracing::{debug, error, info, warn};

use crate::adapters::{Encryptor, ProcessProbe};
use crate::config::AppConfig;
use crate::store::{LogStore, StatusEntry, StatusStore};

use super::coordinator::PriorityCoordinator;
use super::events::JobEvent;
use super::gate::LargeFileGate;
use super::job::{BackupJob, JobError, JobKind, JobSnapshot, JobState, RunHandle};
use super::strategy;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct JobManager {
    config: Arc<AppConfig>,
    jobs: RwLock<Vec<Arc<BackupJob>>>,
    status: Arc<StatusStore>,
    logs: Arc<LogStore>,
    coordinator: Arc<PriorityCoordinator>,
    gate: Arc<LargeFileGate>,
    encryptor: Arc<dyn Encryptor>,
    probe: Arc<dyn ProcessProbe>,
    events: broadcast::Sender<JobEvent>,
    /// Jobs paused by the watcher, as opposed to by an operator. Only these
    /// are resumed when the business software goes away.
    auto_paused: Mutex<HashSet<String>>,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        status: Arc<StatusStore>,
        logs: Arc<LogStore>,
        coordinator: Arc<PriorityCoordinator>,
        gate: Arc<LargeFileGate>,
        encryptor: Arc<dyn Encryptor>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            jobs: RwLock::new(Vec::new()),
            status,
            logs,
            coordinator,
            gate,
            encryptor,
            probe,
            events,
            auto_paused: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    pub fn logs(&self) -> &LogStore {
        &self.logs
    }

    pub fn coordinator(&self) -> &PriorityCoordinator {
        &self.coordinator
    }

    pub fn gate(&self) -> &LargeFileGate {
        &self.gate
    }

    pub fn encryptor(&self) -> &dyn Encryptor {
        self.encryptor.as_ref()
    }

    pub fn probe(&self) -> &dyn ProcessProbe {
        self.probe.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> broadcast::Sender<JobEvent> {
        self.events.clone()
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }

    /// Broadcasts the job's current state and mirrors it into the status
    /// file. Store failures are logged, never fatal to the control path.
    pub(crate) async fn publish_state(&self, job: &BackupJob) {
        let state = job.state();
        self.emit(JobEvent::StateChanged {
            name: job.name().to_string(),
            state,
        });
        if let Err(err) = self
            .status
            .set_state(job.name(), state, job.progress())
            .await
        {
            warn!(job = %job.name(), error = %err, "could not persist job state");
        }
    }

    /// Registers a new job and its fresh status entry.
    ///
    /// The source must already exist; the target directory is created. If a
    /// status entry for the same name survived a restart, its history (most
    /// importantly the last completed run) is carried over so incremental
    /// selection keeps working.
    pub async fn create(
        &self,
        name: &str,
        source: &Path,
        target: &Path,
        kind: JobKind,
    ) -> Result<Arc<BackupJob>, JobError> {
        if name.trim().is_empty() {
            return Err(JobError::EmptyName);
        }
        match tokio::fs::metadata(source).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => return Err(JobError::MissingSource(source.to_path_buf())),
        }
        tokio::fs::create_dir_all(target).await?;

        let job = {
            let mut jobs = self.jobs.write().await;
            if jobs.iter().any(|j| j.name() == name) {
                return Err(JobError::DuplicateName(name.to_string()));
            }
            let job = Arc::new(BackupJob::new(name, source, target, kind));
            jobs.push(Arc::clone(&job));
            job
        };

        let entry = match self.status.get(name).await {
            Some(mut prior) => {
                prior.source = source.to_path_buf();
                prior.target = target.to_path_buf();
                prior.state = JobState::Ready;
                prior.progress = 0;
                prior
            }
            None => StatusEntry::new(name, source, target),
        };
        if let Err(err) = self.status.upsert(entry).await {
            warn!(job = name, error = %err, "could not persist new job");
        }

        info!(job = name, kind = kind.as_str(), "job created");
        self.emit(JobEvent::Created {
            name: name.to_string(),
            kind,
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(job)
    }

    /// Removes a job that is not mid-run, along with its status entry.
    pub async fn delete(&self, name: &str) -> Result<(), JobError> {
        {
            let mut jobs = self.jobs.write().await;
            let index = jobs
                .iter()
                .position(|j| j.name() == name)
                .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
            if jobs[index].state().is_active() {
                return Err(JobError::Busy(name.to_string()));
            }
            jobs.remove(index);
        }
        self.auto_paused.lock().expect("pause set lock poisoned").remove(name);
        if let Err(err) = self.status.remove(name).await {
            warn!(job = name, error = %err, "could not remove status entry");
        }
        info!(job = name, "job deleted");
        self.emit(JobEvent::Deleted {
            name: name.to_string(),
        });
        Ok(())
    }

    pub async fn find(&self, name: &str) -> Option<Arc<BackupJob>> {
        self.jobs
            .read()
            .await
            .iter()
            .find(|j| j.name() == name)
            .cloned()
    }

    /// Snapshots of all jobs, in creation order.
    pub async fn jobs(&self) -> Vec<JobSnapshot> {
        self.jobs.read().await.iter().map(|j| j.snapshot()).collect()
    }

    /// Claims `job` for a new run while it is still a member of this
    /// manager. Claiming under the jobs lock serializes with [`Self::delete`],
    /// so a delete arriving right behind a start either sees the claim and
    /// refuses, or wins and leaves nothing for the run task to act on.
    async fn claim(&self, job: &Arc<BackupJob>) -> Option<RunHandle> {
        let jobs = self.jobs.read().await;
        if !jobs.iter().any(|candidate| Arc::ptr_eq(candidate, job)) {
            return None;
        }
        job.begin_run()
    }

    /// Protocol-facing start: never fails, only logs why nothing happened.
    /// Starting a paused job resumes it instead.
    pub async fn execute(self: &Arc<Self>, name: &str) {
        let Some(job) = self.find(name).await else {
            warn!(job = name, "start requested for unknown job");
            return;
        };
        match job.state() {
            JobState::Running | JobState::PausedForPriority => {
                debug!(job = name, "start ignored, job already running");
            }
            JobState::Paused => {
                if let Err(err) = self.resume(name).await {
                    warn!(job = name, error = %err, "could not resume paused job");
                }
            }
            _ => {
                if let Some(process) = self.probe.blocking_process() {
                    warn!(job = name, process = %process, "start refused while business software is running");
                    return;
                }
                let Some(handle) = self.claim(&job).await else {
                    debug!(job = name, "start ignored, job claimed or deleted meanwhile");
                    return;
                };
                self.publish_state(&job).await;
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = manager.run_to_completion(job, handle).await;
                });
            }
        }
    }

    /// Starts a run and waits for it to finish, surfacing its error.
    pub async fn execute_and_wait(self: &Arc<Self>, name: &str) -> Result<(), JobError> {
        let job = self
            .find(name)
            .await
            .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
        match job.state() {
            JobState::Running | JobState::PausedForPriority => {
                Err(JobError::Busy(name.to_string()))
            }
            JobState::Paused => {
                self.resume(name).await?;
                Ok(())
            }
            _ => {
                if let Some(process) = self.probe.blocking_process() {
                    return Err(JobError::Blocked(process));
                }
                let handle = self
                    .claim(&job)
                    .await
                    .ok_or_else(|| JobError::Busy(name.to_string()))?;
                self.publish_state(&job).await;
                self.run_to_completion(job, handle).await
            }
        }
    }

    /// Runs every job once, in creation order.
    ///
    /// Sequential mode stops dispatching when business software appears;
    /// concurrent mode pushes all jobs through a bounded worker pool. One
    /// job's failure never cancels its siblings.
    pub async fn execute_all(self: &Arc<Self>) {
        let names: Vec<String> = self.jobs().await.into_iter().map(|j| j.name).collect();
        if names.is_empty() {
            debug!("start all requested with no jobs");
            return;
        }
        if self.config.concurrent {
            let pool = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
            let mut handles = Vec::new();
            for name in names {
                let manager = Arc::clone(self);
                let pool = Arc::clone(&pool);
                handles.push(tokio::spawn(async move {
                    let _slot = pool
                        .acquire_owned()
                        .await
                        .expect("run pool semaphore is never closed");
                    manager.dispatch_one(&name).await;
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        } else {
            for name in names {
                if let Some(process) = self.probe.blocking_process() {
                    warn!(process = %process, "run-all stopped, business software is running");
                    break;
                }
                self.dispatch_one(&name).await;
            }
        }
    }

    async fn dispatch_one(self: &Arc<Self>, name: &str) {
        match self.execute_and_wait(name).await {
            Ok(()) => {}
            Err(JobError::Busy(_)) => debug!(job = name, "already running, skipped"),
            Err(JobError::Blocked(process)) => {
                warn!(job = name, process = %process, "skipped while business software is running");
            }
            Err(err) => warn!(job = name, error = %err, "job failed, continuing with the rest"),
        }
    }

    /// Drives an already claimed run to its terminal state. Every terminal
    /// write goes through the handle, so a task superseded by a restart
    /// cannot stomp the successor run's state or progress.
    async fn run_to_completion(
        self: &Arc<Self>,
        job: Arc<BackupJob>,
        mut handle: RunHandle,
    ) -> Result<(), JobError> {
        let result = strategy::execute_run(self, &job, &mut handle).await;
        match result {
            Ok(()) => {
                if job.finish(&handle, JobState::Completed) {
                    job.set_progress(handle.generation(), 100);
                    self.emit(JobEvent::Progress {
                        name: job.name().to_string(),
                        percent: 100,
                    });
                    self.publish_state(&job).await;
                    info!(job = %job.name(), "backup run completed");
                }
                Ok(())
            }
            Err(JobError::Cancelled) => {
                // The stop command already moved the job to Stopped and
                // published it. A file that was mid-copy at that moment ran
                // to its end and kept reporting, so progress is re-zeroed
                // now that the run is truly done.
                job.finish(&handle, JobState::Stopped);
                if job.owns_run(&handle) {
                    job.set_progress(handle.generation(), 0);
                    self.emit(JobEvent::Progress {
                        name: job.name().to_string(),
                        percent: 0,
                    });
                    if let Err(err) = self
                        .status
                        .set_state(job.name(), JobState::Stopped, 0)
                        .await
                    {
                        warn!(job = %job.name(), error = %err, "could not persist stopped state");
                    }
                }
                info!(job = %job.name(), "backup run stopped");
                Ok(())
            }
            Err(err) => {
                error!(job = %job.name(), error = %err, "backup run failed");
                if job.finish(&handle, JobState::Error) {
                    self.publish_state(&job).await;
                }
                Err(err)
            }
        }
    }

    pub async fn pause(&self, name: &str) -> Result<(), JobError> {
        let job = self
            .find(name)
            .await
            .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
        if job.pause() {
            info!(job = name, "job paused");
            self.publish_state(&job).await;
        } else {
            debug!(job = name, state = ?job.state(), "pause ignored");
        }
        Ok(())
    }

    pub async fn resume(&self, name: &str) -> Result<(), JobError> {
        let job = self
            .find(name)
            .await
            .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
        self.auto_paused.lock().expect("pause set lock poisoned").remove(name);
        if job.resume() {
            info!(job = name, "job resumed");
            self.publish_state(&job).await;
        } else {
            debug!(job = name, state = ?job.state(), "resume ignored");
        }
        Ok(())
    }

    /// Cancels a run. Progress drops to zero immediately; the run task winds
    /// down at its next checkpoint.
    pub async fn stop(&self, name: &str) -> Result<(), JobError> {
        let job = self
            .find(name)
            .await
            .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
        if job.stop() {
            info!(job = name, "stop requested");
            self.emit(JobEvent::Progress {
                name: name.to_string(),
                percent: 0,
            });
            self.publish_state(&job).await;
        } else {
            debug!(job = name, state = ?job.state(), "stop ignored");
        }
        Ok(())
    }

    /// Watcher entry point: pauses every running job and remembers which
    /// ones, so only those resume when the software exits.
    pub async fn auto_pause_all(&self, process: &str) {
        let jobs: Vec<Arc<BackupJob>> = self.jobs.read().await.clone();
        let mut paused = Vec::new();
        for job in &jobs {
            if job.pause() {
                paused.push(Arc::clone(job));
            }
        }
        if paused.is_empty() {
            return;
        }
        warn!(process, count = paused.len(), "business software detected, pausing running jobs");
        {
            let mut auto = self.auto_paused.lock().expect("pause set lock poisoned");
            auto.extend(paused.iter().map(|j| j.name().to_string()));
        }
        for job in &paused {
            self.publish_state(job).await;
        }
    }

    /// Watcher entry point: resumes the jobs the watcher itself paused.
    pub async fn auto_resume_all(&self) {
        let names: Vec<String> = {
            let mut auto = self.auto_paused.lock().expect("pause set lock poisoned");
            auto.drain().collect()
        };
        if names.is_empty() {
            return;
        }
        info!(count = names.len(), "business software gone, resuming auto-paused jobs");
        for name in names {
            if let Some(job) = self.find(&name).await {
                if job.resume() {
                    self.publish_state(&job).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{DisabledProbe, SimulatedEncryptor};
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager_with(dir: &TempDir) -> Arc<JobManager> {
        manager_with_config(dir, AppConfig::default())
    }

    fn manager_with_config(dir: &TempDir, mut config: AppConfig) -> Arc<JobManager> {
        config.data_dir = dir.path().join("data");
        JobManager::new(
            Arc::new(config),
            Arc::new(StatusStore::new(&dir.path().join("data"))),
            Arc::new(LogStore::new(&dir.path().join("data"))),
            Arc::new(PriorityCoordinator::new(Duration::from_millis(50))),
            Arc::new(LargeFileGate::new()),
            Arc::new(SimulatedEncryptor::new()),
            Arc::new(DisabledProbe),
        )
    }

    #[tokio::test]
    async fn test_create_validates_name_and_source() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir);
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        let target = dir.path().join("dst");

        assert!(matches!(
            manager.create("", &source, &target, JobKind::Full).await,
            Err(JobError::EmptyName)
        ));
        assert!(matches!(
            manager
                .create("a", &dir.path().join("missing"), &target, JobKind::Full)
                .await,
            Err(JobError::MissingSource(_))
        ));

        manager.create("a", &source, &target, JobKind::Full).await.unwrap();
        assert!(target.is_dir());
        assert!(matches!(
            manager.create("a", &source, &target, JobKind::Full).await,
            Err(JobError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn test_create_preserves_last_run_from_a_prior_entry() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir);
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();

        let when = chrono::Utc::now();
        let mut prior = StatusEntry::new("a", &source, &dir.path().join("dst"));
        prior.last_run = Some(when);
        prior.state = JobState::Completed;
        manager.status().upsert(prior).await.unwrap();

        manager
            .create("a", &source, &dir.path().join("dst"), JobKind::Incremental)
            .await
            .unwrap();
        let entry = manager.status().get("a").await.unwrap();
        assert_eq!(entry.last_run, Some(when));
        assert_eq!(entry.state, JobState::Ready);
    }

    #[tokio::test]
    async fn test_delete_removes_job_and_entry() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir);
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();

        manager
            .create("a", &source, &dir.path().join("dst"), JobKind::Full)
            .await
            .unwrap();
        assert!(manager.status().get("a").await.is_some());

        manager.delete("a").await.unwrap();
        assert!(manager.find("a").await.is_none());
        assert!(manager.status().get("a").await.is_none());
        assert!(matches!(
            manager.delete("a").await,
            Err(JobError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_delete_are_broadcast() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir);
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        let mut events = manager.subscribe();

        manager
            .create("a", &source, &dir.path().join("dst"), JobKind::Full)
            .await
            .unwrap();
        manager.delete("a").await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            JobEvent::Created { name, .. } if name == "a"
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            JobEvent::Deleted { name } if name == "a"
        ));
    }

    #[tokio::test]
    async fn test_control_of_unknown_jobs_errors() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir);
        assert!(matches!(manager.pause("x").await, Err(JobError::UnknownJob(_))));
        assert!(matches!(manager.resume("x").await, Err(JobError::UnknownJob(_))));
        assert!(matches!(manager.stop("x").await, Err(JobError::UnknownJob(_))));
        // Protocol-facing start only logs.
        manager.execute("x").await;
    }

    #[tokio::test]
    async fn test_delete_right_behind_a_start_sees_the_claim() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            chunk_delay_ms: 20,
            ..AppConfig::default()
        };
        let manager = manager_with_config(&dir, config);
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        for i in 0..4 {
            std::fs::write(source.join(format!("f{i}.bin")), vec![0u8; 2048]).unwrap();
        }
        manager
            .create("docs", &source, &dir.path().join("dst"), JobKind::Full)
            .await
            .unwrap();

        // The start claims the job before returning, so the job is already
        // active when the delete arrives.
        manager.execute("docs").await;
        assert!(matches!(
            manager.delete("docs").await,
            Err(JobError::Busy(_))
        ));

        let job = manager.find("docs").await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while job.state() != JobState::Completed {
            assert!(tokio::time::Instant::now() < deadline, "run never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.delete("docs").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.find("docs").await.is_none());
        assert!(manager.status().get("docs").await.is_none());
    }
}
