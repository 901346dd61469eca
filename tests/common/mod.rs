//! Shared fixture for the integration tests: a full daemon core wired
//! against a temporary directory, with the simulated collaborators' control
//! handles exposed so tests can script them.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use keepd::adapters::{DisabledProbe, SimulatedEncryptor, SimulatedProbe, SimulatedProbeController};
use keepd::config::AppConfig;
use keepd::context::AppContext;
use keepd::core::{JobManager, JobState, LargeFileGate, PriorityCoordinator};
use keepd::net::{ControlClient, ControlServer, SnapshotServer};
use keepd::store::{LogStore, StatusStore};

pub struct TestRig {
    pub root: TempDir,
    pub config: Arc<AppConfig>,
    pub manager: Arc<JobManager>,
    pub encryptor: Arc<SimulatedEncryptor>,
    pub probe: SimulatedProbeController,
}

pub fn rig() -> TestRig {
    rig_with(AppConfig::default())
}

pub fn rig_with(config: AppConfig) -> TestRig {
    rig_with_encryptor(config, SimulatedEncryptor::new())
}

pub fn rig_with_encryptor(mut config: AppConfig, encryptor: SimulatedEncryptor) -> TestRig {
    let root = TempDir::new().expect("create temp dir");
    config.data_dir = root.path().join("data");
    let config = Arc::new(config);
    let encryptor = Arc::new(encryptor);
    let (probe, controller) = SimulatedProbe::new(config.business_processes.clone());
    let manager = JobManager::new(
        Arc::clone(&config),
        Arc::new(StatusStore::new(&config.data_dir)),
        Arc::new(LogStore::new(&config.data_dir)),
        Arc::new(PriorityCoordinator::new(Duration::from_millis(
            config.coordinator_poll_ms,
        ))),
        Arc::new(LargeFileGate::new()),
        encryptor.clone(),
        Arc::new(probe),
    );
    TestRig {
        root,
        config,
        manager,
        encryptor,
        probe: controller,
    }
}

/// A second manager over the same data directory, as after a daemon restart.
pub fn manager_over(rig: &TestRig) -> Arc<JobManager> {
    JobManager::new(
        Arc::clone(&rig.config),
        Arc::new(StatusStore::new(&rig.config.data_dir)),
        Arc::new(LogStore::new(&rig.config.data_dir)),
        Arc::new(PriorityCoordinator::new(Duration::from_millis(
            rig.config.coordinator_poll_ms,
        ))),
        Arc::new(LargeFileGate::new()),
        Arc::new(SimulatedEncryptor::new()),
        Arc::new(DisabledProbe),
    )
}

impl TestRig {
    /// Creates (if needed) and returns a directory under the rig root.
    pub fn dir(&self, name: &str) -> PathBuf {
        let path = self.root.path().join(name);
        std::fs::create_dir_all(&path).expect("create dir");
        path
    }

    /// Writes a file under the rig root, creating parent directories.
    pub fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.root.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, contents).expect("write file");
        path
    }
}

/// Polls until the job reaches `state` or the deadline passes.
pub async fn wait_for_state(manager: &JobManager, name: &str, state: JobState, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let current = manager.find(name).await.map(|job| job.state());
        if current == Some(state) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("job '{name}' never reached {state:?}, last seen {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Number of regular files under `dir`, recursively. A missing directory
/// counts as empty.
pub fn count_files(dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += count_files(&path);
        } else {
            count += 1;
        }
    }
    count
}

/// Binds a control server on an ephemeral port and serves it in the
/// background. The returned handle keeps the server alive and can shut it
/// down.
pub async fn start_control(rig: &TestRig) -> (Arc<ControlServer>, SocketAddr) {
    let ctx = AppContext::new(Arc::clone(&rig.config), Arc::clone(&rig.manager));
    let server = Arc::new(
        ControlServer::bind(ctx, "127.0.0.1:0".parse().expect("valid address"))
            .await
            .expect("bind control server"),
    );
    let addr = server.local_addr();
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.start().await;
    });
    (server, addr)
}

/// Same as [`start_control`] for the read-only snapshot feed.
pub async fn start_snapshot(rig: &TestRig) -> (Arc<SnapshotServer>, SocketAddr) {
    let ctx = AppContext::new(Arc::clone(&rig.config), Arc::clone(&rig.manager));
    let server = Arc::new(
        SnapshotServer::bind(ctx, "127.0.0.1:0".parse().expect("valid address"))
            .await
            .expect("bind snapshot server"),
    );
    let addr = server.local_addr();
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serving.start().await;
    });
    (server, addr)
}

/// Reads broadcast lines until one satisfies `stop`, panicking on timeout or
/// a closed session. Returns every line read, the matching one last.
pub async fn read_until(
    client: &mut ControlClient,
    within: Duration,
    mut stop: impl FnMut(&str) -> bool,
) -> Vec<String> {
    let mut lines = Vec::new();
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for a line, got: {lines:#?}"));
        let line = tokio::time::timeout(remaining, client.next_line())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for a line, got: {lines:#?}"))
            .expect("read from control session")
            .unwrap_or_else(|| panic!("session closed early, got: {lines:#?}"));
        let done = stop(&line);
        lines.push(line);
        if done {
            return lines;
        }
    }
}
