//! Legacy read-only snapshot feed.
//!
//! Older monitoring consoles expect one line per second describing every
//! job. This server only writes; anything a client sends is ignored. Each
//! client gets its own writer task fed through a bounded queue, so one
//! stalled console cannot hold up the ticker or new connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::context::AppContext;

use super::protocol::snapshot_line;

pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshots a slow client may have queued before being dropped.
const CLIENT_BUFFER: usize = 8;

type ClientRegistry = Arc<Mutex<HashMap<u64, mpsc::Sender<String>>>>;

pub struct SnapshotServer {
    ctx: AppContext,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl SnapshotServer {
    pub async fn bind(ctx: AppContext, addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind snapshot port {}", addr))?;
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
        info!(addr = %self.local_addr, "snapshot server listening");
        let clients: ClientRegistry = Arc::new(Mutex::new(HashMap::new()));
        let next_id = AtomicU64::new(1);

        let ticker = {
            let manager = Arc::clone(&self.ctx.manager);
            let clients = Arc::clone(&clients);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let line = snapshot_line(&manager.jobs().await);
                            push_to_all(&clients, &line);
                        }
                        _ = shutdown.recv() => break,
                    }
                }
            })
        };

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    if let Ok((stream, peer)) = accepted {
                        debug!(peer = %peer, "snapshot client connected");
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
                        clients
                            .lock()
                            .expect("snapshot registry lock poisoned")
                            .insert(id, tx);
                        tokio::spawn(write_snapshots(stream, rx));
                    }
                }
                _ = shutdown.recv() => {
                    info!("snapshot server shutting down");
                    break;
                }
            }
        }
        let _ = ticker.await;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn write_snapshots(mut stream: TcpStream, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if stream.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Best-effort fan-out: a client whose queue is full or closed is dropped.
fn push_to_all(clients: &ClientRegistry, line: &str) {
    let mut registry = clients.lock().expect("snapshot registry lock poisoned");
    let mut dead = Vec::new();
    for (id, tx) in registry.iter() {
        if tx.try_send(line.to_string()).is_err() {
            dead.push(*id);
        }
    }
    for id in dead {
        registry.remove(&id);
        debug!(client = id, "evicted unresponsive snapshot client");
    }
}
