//! Daemon configuration.
//!
//! Settings are layered: built-in defaults, then the TOML config file, then
//! `KEEPD_*` environment variables, then command-line flags. Later layers
//! win. Jobs may be declared in the file as `[[jobs]]` tables and are created
//! at startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::JobKind;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/keepd/config.toml";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/keepd";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding `state.json` and the daily transfer logs.
    pub data_dir: PathBuf,
    /// Bind address of the command/broadcast protocol.
    pub control_bind: SocketAddr,
    /// Bind address of the read-only snapshot feed.
    pub snapshot_bind: SocketAddr,
    /// Extensions copied before any job may settle into bulk copying.
    /// Accepted with or without the leading dot.
    pub priority_extensions: Vec<String>,
    /// Extensions handed to the encryption collaborator after copying.
    pub encrypt_extensions: Vec<String>,
    /// Key passed through to the encryption collaborator.
    pub encrypt_key: String,
    /// External encryption program. Unset disables encryption.
    pub encrypt_command: Option<PathBuf>,
    /// Process names whose presence suspends all backup activity.
    pub business_processes: Vec<String>,
    /// Files above this size contend for the single large-transfer slot.
    pub large_file_threshold_kb: u64,
    /// Whether "start all" dispatches jobs concurrently.
    pub concurrent: bool,
    /// Worker cap for concurrent "start all".
    pub max_concurrency: usize,
    /// Poll interval of the business-software watcher.
    pub watcher_poll_ms: u64,
    /// Upper bound on how long a run blocked on priority coordination waits
    /// between re-checks.
    pub coordinator_poll_ms: u64,
    /// Slows copies down by sleeping after each chunk of files up to
    /// `chunk_delay_max_kb`. For tests and demos; 0 disables it.
    pub chunk_delay_ms: u64,
    pub chunk_delay_max_kb: u64,
    /// Replace external collaborators with stdin-driven simulations.
    pub simulation: bool,
    pub verbose: bool,
    /// Jobs created at startup.
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// A job declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub kind: JobKind,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            control_bind: "127.0.0.1:4600".parse().expect("valid default address"),
            snapshot_bind: "127.0.0.1:4601".parse().expect("valid default address"),
            priority_extensions: Vec::new(),
            encrypt_extensions: Vec::new(),
            encrypt_key: String::new(),
            encrypt_command: None,
            business_processes: Vec::new(),
            large_file_threshold_kb: 4096,
            concurrent: true,
            max_concurrency: 4,
            watcher_poll_ms: 1000,
            coordinator_poll_ms: 1000,
            chunk_delay_ms: 0,
            chunk_delay_max_kb: 512,
            simulation: false,
            verbose: false,
            jobs: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Builds the effective configuration.
    ///
    /// `file` forces a specific config file and fails if it is missing; with
    /// `None` the default path is used when present. `overrides` is the
    /// serialized CLI argument struct, merged last.
    pub fn new<A: Serialize>(file: Option<&Path>, overrides: Option<&A>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        figment = match file {
            Some(path) => figment.merge(Toml::file_exact(path)),
            None => figment.merge(Toml::file(DEFAULT_CONFIG_PATH)),
        };
        figment = figment.merge(Env::prefixed("KEEPD_"));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }
        figment.extract().context("Failed to load configuration")
    }

    /// Writes the built-in defaults as a starting config file.
    pub fn write_default(path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(&AppConfig::default())
            .context("Failed to serialize default config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }
}
