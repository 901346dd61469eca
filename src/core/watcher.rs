//! Polls the process probe and pauses or resumes jobs as configured
//! business software comes and goes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::manager::JobManager;

/// Spawns the watcher loop. It exits when the shutdown channel fires.
pub fn spawn(manager: Arc<JobManager>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
    let poll = Duration::from_millis(manager.config().watcher_poll_ms.max(50));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        // A pause burst after a slow tick would be wrong; skip missed ticks.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut blocking: Option<String> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match (manager.probe().blocking_process(), &blocking) {
                        (Some(process), None) => {
                            manager.auto_pause_all(&process).await;
                            blocking = Some(process);
                        }
                        (None, Some(_)) => {
                            manager.auto_resume_all().await;
                            blocking = None;
                        }
                        _ => {}
                    }
                }
                _ = shutdown.recv() => {
                    debug!("watcher shutting down");
                    break;
                }
            }
        }
    })
}
