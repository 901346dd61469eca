use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// External encryption collaborator.
///
/// Implementations encrypt a file in place after it has been copied. The
/// return value mirrors the collaborator contract: elapsed milliseconds
/// (>= 0) on success, a negative error code on failure. 0 also stands for
/// "nothing to encrypt".
#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn encrypt(&self, path: &Path, key: &str) -> i64;
}

/// Used when no encryption program is configured.
pub struct NoopEncryptor;

#[async_trait]
impl Encryptor for NoopEncryptor {
    async fn encrypt(&self, _path: &Path, _key: &str) -> i64 {
        0
    }
}

/// Runs a configured external program as `<program> <file> <key>` and waits
/// for it to exit.
pub struct CommandEncryptor {
    program: PathBuf,
}

impl CommandEncryptor {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl Encryptor for CommandEncryptor {
    async fn encrypt(&self, path: &Path, key: &str) -> i64 {
        let started = Instant::now();
        let output = Command::new(&self.program).arg(path).arg(key).output().await;
        match output {
            Ok(output) if output.status.success() => {
                let elapsed = started.elapsed().as_millis() as i64;
                debug!(path = %path.display(), elapsed_ms = elapsed, "file encrypted");
                elapsed
            }
            Ok(output) => {
                // Exit codes are reported back as negative values; a signal
                // death has no code and maps to -1.
                let code = output.status.code().unwrap_or(1).abs() as i64;
                warn!(
                    path = %path.display(),
                    code,
                    "encryption program reported failure"
                );
                -code
            }
            Err(err) => {
                warn!(
                    program = %self.program.display(),
                    error = %err,
                    "could not launch encryption program"
                );
                -1
            }
        }
    }
}
