use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use keepd::adapters;
use keepd::config::AppConfig;
use keepd::context::AppContext;
use keepd::core::{JobManager, LargeFileGate, PriorityCoordinator, watcher};
use keepd::logging::{self, LogConfig};
use keepd::net::{ControlClient, ControlServer, SnapshotServer};
use keepd::store::{LogStore, StatusStore};

#[derive(Parser)]
#[command(name = "keepd")]
#[command(about = "File backup orchestration daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Daemon(DaemonArgs),
    /// Talk to a running daemon.
    Ctl(CtlArgs),
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    /// Path to the TOML configuration file.
    #[serde(skip)]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the default configuration to the given path and exit.
    #[serde(skip)]
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Emit logs as JSON instead of human-readable lines.
    #[serde(skip)]
    #[arg(long)]
    log_json: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    control_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    snapshot_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    concurrent: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrency: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,
}

#[derive(Args)]
struct CtlArgs {
    /// Control port of the daemon.
    #[arg(long, default_value = "127.0.0.1:4600")]
    addr: SocketAddr,

    #[command(subcommand)]
    action: CtlAction,
}

#[derive(Subcommand)]
enum CtlAction {
    /// Print the jobs the daemon knows and their states.
    List,
    /// Stream broadcasts until interrupted.
    Watch,
    /// Start one job.
    Start { name: String },
    /// Start every job.
    StartAll,
    /// Pause a running job.
    Pause { name: String },
    /// Resume a paused job.
    Resume { name: String },
    /// Stop a job and discard its run.
    Stop { name: String },
    /// Delete a job that is not running.
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon(args) => {
            if let Some(path) = &args.write_config {
                AppConfig::write_default(path)?;
                println!("Wrote default configuration to {}", path.display());
                return Ok(());
            }
            let config = AppConfig::new(args.config.as_deref(), Some(&args))?;
            logging::init(LogConfig {
                json: args.log_json,
                verbose: config.verbose,
            });
            run_daemon(config).await.context("Failed to run daemon")?;
        }
        Commands::Ctl(args) => run_ctl(args).await?,
    }
    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let config = Arc::new(config);
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;

    let status = Arc::new(StatusStore::new(&config.data_dir));
    let logs = Arc::new(LogStore::new(&config.data_dir));
    let coordinator = Arc::new(PriorityCoordinator::new(Duration::from_millis(
        config.coordinator_poll_ms.max(50),
    )));
    let gate = Arc::new(LargeFileGate::new());
    let encryptor = adapters::build_encryptor(&config);
    let probe = adapters::build_probe(&config);
    let manager = JobManager::new(
        Arc::clone(&config),
        Arc::clone(&status),
        logs,
        coordinator,
        gate,
        encryptor,
        probe,
    );

    for spec in &config.jobs {
        if let Err(err) = manager
            .create(&spec.name, &spec.source, &spec.target, spec.kind)
            .await
        {
            warn!(job = %spec.name, error = %err, "skipping declared job");
        }
    }
    // Status entries of jobs no longer declared are stale leftovers.
    let declared: Vec<String> = config.jobs.iter().map(|j| j.name.clone()).collect();
    status.prune(&declared).await?;

    let ctx = AppContext::new(Arc::clone(&config), Arc::clone(&manager));
    let (shutdown_tx, _) = broadcast::channel(1);
    let watcher = watcher::spawn(Arc::clone(&manager), shutdown_tx.subscribe());

    let control = Arc::new(ControlServer::bind(ctx.clone(), config.control_bind).await?);
    let snapshot = Arc::new(SnapshotServer::bind(ctx.clone(), config.snapshot_bind).await?);
    info!(
        control = %control.local_addr(),
        snapshot = %snapshot.local_addr(),
        jobs = config.jobs.len(),
        "keepd ready"
    );

    let control_task = {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            if let Err(err) = control.start().await {
                error!(error = %err, "control server terminated");
            }
        })
    };
    let snapshot_task = {
        let snapshot = Arc::clone(&snapshot);
        tokio::spawn(async move {
            if let Err(err) = snapshot.start().await {
                error!(error = %err, "snapshot server terminated");
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    control.shutdown();
    snapshot.shutdown();
    let _ = shutdown_tx.send(());
    let _ = control_task.await;
    let _ = snapshot_task.await;
    let _ = watcher.await;
    Ok(())
}

async fn run_ctl(args: CtlArgs) -> Result<()> {
    let mut client = ControlClient::connect(args.addr)
        .await
        .with_context(|| format!("Failed to connect to daemon at {}", args.addr))?;

    match args.action {
        CtlAction::List => {
            for line in client.drain_for(Duration::from_millis(400)).await? {
                println!("{}", line);
            }
        }
        CtlAction::Watch => {
            while let Some(line) = client.next_line().await? {
                println!("{}", line);
            }
        }
        action => {
            let line = match action {
                CtlAction::Start { name } => format!("START|{}", name),
                CtlAction::StartAll => "START_ALL|ALL".to_string(),
                CtlAction::Pause { name } => format!("PAUSE|{}", name),
                CtlAction::Resume { name } => format!("RESUME|{}", name),
                CtlAction::Stop { name } => format!("STOP|{}", name),
                CtlAction::Delete { name } => format!("DELETE|{}", name),
                CtlAction::List | CtlAction::Watch => unreachable!(),
            };
            // Swallow the connection dump so only the reaction is printed.
            let _ = client.drain_for(Duration::from_millis(200)).await?;
            client.send(&line).await?;
            for line in client.drain_for(Duration::from_millis(600)).await? {
                println!("{}", line);
            }
        }
    }
    Ok(())
}
