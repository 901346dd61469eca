//! TCP transport for the control protocol.
//!
//! Newline-delimited text, one command or broadcast per line. Each client
//! connection gets a reader task (commands) and a writer task fed through a
//! bounded queue; broadcasts that cannot be queued evict the client rather
//! than stall the daemon.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::{JobEvent, JobManager, JobSnapshot, JobState};

use super::protocol::{
    Command, backup_line, deleted_line, progress_line, state_line, wire_state,
};

/// Broadcast lines a slow client may have queued before being dropped.
const CLIENT_BUFFER: usize = 64;

type ClientRegistry = Arc<Mutex<HashMap<u64, mpsc::Sender<String>>>>;

pub struct ControlServer {
    ctx: AppContext,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    /// Binds the listener. `start` must be called to begin serving.
    pub async fn bind(ctx: AppContext, addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind control port {}", addr))?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            ctx,
            listener,
            local_addr,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until `shutdown` is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "control server listening");
        let clients: ClientRegistry = Arc::new(Mutex::new(HashMap::new()));
        let next_id = AtomicU64::new(1);

        let forwarder = tokio::spawn(forward_events(
            Arc::clone(&self.ctx.manager),
            Arc::clone(&clients),
            self.shutdown_tx.subscribe(),
        ));

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "client connected");
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            let manager = Arc::clone(&self.ctx.manager);
                            let clients = Arc::clone(&clients);
                            tokio::spawn(handle_client(stream, peer, id, manager, clients));
                        }
                        Err(err) => {
                            error!(error = %err, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("control server shutting down");
                    break;
                }
            }
        }
        let _ = forwarder.await;
        Ok(())
    }

    /// Signals the accept loop and the event forwarder to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    manager: Arc<JobManager>,
    clients: ClientRegistry,
) {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<String>(CLIENT_BUFFER);
    tokio::spawn(write_lines(writer, rx));

    // Every connection starts with the full job list. Events raised between
    // this snapshot and registration below are not replayed; the next state
    // change catches the client up.
    let jobs = manager.jobs().await;
    for snapshot in &jobs {
        if tx.send(backup_line(snapshot)).await.is_err() {
            return;
        }
    }
    for snapshot in &jobs {
        if tx.send(state_line(&snapshot.name, snapshot.state)).await.is_err() {
            return;
        }
    }
    clients
        .lock()
        .expect("client registry lock poisoned")
        .insert(id, tx);

    let result = read_commands(reader, peer, &manager).await;
    clients
        .lock()
        .expect("client registry lock poisoned")
        .remove(&id);
    if let Err(err) = result {
        debug!(peer = %peer, error = %err, "connection error");
    }
    debug!(peer = %peer, "client disconnected");
}

async fn write_lines(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn read_commands(
    reader: OwnedReadHalf,
    peer: SocketAddr,
    manager: &Arc<JobManager>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match Command::parse(trimmed) {
            Ok(command) => {
                debug!(peer = %peer, command = ?command, "command received");
                // Dispatch without blocking the read loop; a START_ALL may
                // run for minutes and the client must stay able to pause or
                // stop jobs meanwhile.
                let manager = Arc::clone(manager);
                tokio::spawn(async move {
                    apply_command(manager, command).await;
                });
            }
            Err(reason) => {
                warn!(peer = %peer, reason, line = trimmed, "malformed command, closing session");
                break;
            }
        }
    }
    Ok(())
}

async fn apply_command(manager: Arc<JobManager>, command: Command) {
    match command {
        Command::Start(name) => manager.execute(&name).await,
        Command::StartAll => manager.execute_all().await,
        Command::Pause(name) => {
            if let Err(err) = manager.pause(&name).await {
                warn!(job = %name, error = %err, "pause failed");
            }
        }
        Command::Resume(name) => {
            if let Err(err) = manager.resume(&name).await {
                warn!(job = %name, error = %err, "resume failed");
            }
        }
        Command::Stop(name) => {
            if let Err(err) = manager.stop(&name).await {
                warn!(job = %name, error = %err, "stop failed");
            }
        }
        Command::Delete(name) => {
            if let Err(err) = manager.delete(&name).await {
                warn!(job = %name, error = %err, "delete refused");
            }
        }
    }
}

/// Relays manager events to every connected client.
///
/// State broadcasts are deduplicated per job on the WIRE label, so internal
/// transitions that map to the same external state (for example Paused and
/// PausedForPriority) do not produce repeated lines.
async fn forward_events(
    manager: Arc<JobManager>,
    clients: ClientRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut events = manager.subscribe();
    let mut last_state: HashMap<String, &'static str> = HashMap::new();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            received = events.recv() => match received {
                Ok(event) => {
                    for line in render_event(&mut last_state, event) {
                        broadcast_line(&clients, &line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged, some broadcasts were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn render_event(last_state: &mut HashMap<String, &'static str>, event: JobEvent) -> Vec<String> {
    match event {
        JobEvent::Created {
            name,
            kind,
            source,
            target,
        } => {
            last_state.insert(name.clone(), wire_state(JobState::Ready));
            let snapshot = JobSnapshot {
                name: name.clone(),
                kind,
                source,
                target,
                state: JobState::Ready,
                progress: 0,
            };
            vec![backup_line(&snapshot), state_line(&name, JobState::Ready)]
        }
        JobEvent::StateChanged { name, state } => {
            let label = wire_state(state);
            if last_state.get(&name).copied() == Some(label) {
                return Vec::new();
            }
            last_state.insert(name.clone(), label);
            vec![state_line(&name, state)]
        }
        JobEvent::Progress { name, percent } => vec![progress_line(&name, percent)],
        JobEvent::Deleted { name } => {
            last_state.remove(&name);
            vec![deleted_line(&name)]
        }
    }
}

/// Best-effort fan-out: a client whose queue is full or closed is dropped.
fn broadcast_line(clients: &ClientRegistry, line: &str) {
    let mut registry = clients.lock().expect("client registry lock poisoned");
    let mut dead = Vec::new();
    for (id, tx) in registry.iter() {
        if tx.try_send(line.to_string()).is_err() {
            dead.push(*id);
        }
    }
    for id in dead {
        registry.remove(&id);
        debug!(client = id, "evicted unresponsive client");
    }
}
