use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::encrypt::Encryptor;
use super::process::ProcessProbe;

/// Process probe whose process table is set by hand.
///
/// Only names on the watched list count as business software; reporting an
/// unwatched process has no effect, same as the real probe.
pub struct SimulatedProbe {
    watched: Vec<String>,
    running: Arc<Mutex<Option<String>>>,
}

/// Control handle for a [`SimulatedProbe`], used by tests and by the stdin
/// driver in simulation mode.
#[derive(Clone)]
pub struct SimulatedProbeController {
    running: Arc<Mutex<Option<String>>>,
}

impl SimulatedProbe {
    pub fn new(watched: Vec<String>) -> (Self, SimulatedProbeController) {
        let running = Arc::new(Mutex::new(None));
        (
            Self {
                watched,
                running: Arc::clone(&running),
            },
            SimulatedProbeController { running },
        )
    }
}

impl ProcessProbe for SimulatedProbe {
    fn blocking_process(&self) -> Option<String> {
        let running = self.running.lock().expect("probe lock poisoned");
        running
            .as_ref()
            .filter(|name| self.watched.iter().any(|w| w == *name))
            .cloned()
    }
}

impl SimulatedProbeController {
    pub fn start_process(&self, name: &str) {
        *self.running.lock().expect("probe lock poisoned") = Some(name.to_string());
    }

    pub fn stop_process(&self) {
        *self.running.lock().expect("probe lock poisoned") = None;
    }
}

/// Encryptor double with a scripted result and a call log.
pub struct SimulatedEncryptor {
    delay: Duration,
    fail_code: Option<i64>,
    calls: Arc<Mutex<Vec<PathBuf>>>,
}

impl SimulatedEncryptor {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(2),
            fail_code: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Every call will report the given negative error code.
    pub fn failing(code: i64) -> Self {
        Self {
            fail_code: Some(code),
            ..Self::new()
        }
    }

    /// Paths encrypted so far, in call order.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().expect("encryptor lock poisoned").clone()
    }
}

impl Default for SimulatedEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Encryptor for SimulatedEncryptor {
    async fn encrypt(&self, path: &Path, _key: &str) -> i64 {
        tokio::time::sleep(self.delay).await;
        self.calls
            .lock()
            .expect("encryptor lock poisoned")
            .push(path.to_path_buf());
        match self.fail_code {
            Some(code) => code,
            None => self.delay.as_millis() as i64,
        }
    }
}
