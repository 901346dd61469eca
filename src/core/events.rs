use std::path::PathBuf;

use super::job::{JobKind, JobState};

/// Notifications raised by the job manager as jobs change.
///
/// Delivered over a `tokio::sync::broadcast` channel; the control server
/// forwards them to every connected client, other subscribers (tests, the
/// snapshot feed) read them directly.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Created {
        name: String,
        kind: JobKind,
        source: PathBuf,
        target: PathBuf,
    },
    StateChanged {
        name: String,
        state: JobState,
    },
    Progress {
        name: String,
        percent: u8,
    },
    Deleted {
        name: String,
    },
}

impl JobEvent {
    /// Job name the event refers to.
    pub fn job(&self) -> &str {
        match self {
            JobEvent::Created { name, .. }
            | JobEvent::StateChanged { name, .. }
            | JobEvent::Progress { name, .. }
            | JobEvent::Deleted { name } => name,
        }
    }
}
