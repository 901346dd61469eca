//! Wire format of the control protocol.
//!
//! Lines are pipe-delimited text, one message per line. Clients send
//! commands (`START|docs`), the server broadcasts job changes
//! (`STATE|docs|RUNNING`, `PROGRESS|docs|42`). The snapshot feed packs all
//! jobs into a single semicolon-joined line.

use crate::core::{JobSnapshot, JobState};

/// A client command, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(String),
    StartAll,
    Pause(String),
    Resume(String),
    Stop(String),
    Delete(String),
}

impl Command {
    /// Parses one line. Unknown verbs, missing separators, and empty
    /// arguments are all rejected; the caller ends the session on any error.
    pub fn parse(line: &str) -> Result<Self, &'static str> {
        let (verb, argument) = line
            .trim()
            .split_once('|')
            .ok_or("missing '|' separator")?;
        let argument = argument.trim();
        if argument.is_empty() {
            return Err("missing argument");
        }
        match verb {
            "START" => Ok(Command::Start(argument.to_string())),
            "START_ALL" => {
                if argument == "ALL" {
                    Ok(Command::StartAll)
                } else {
                    Err("START_ALL takes the literal argument ALL")
                }
            }
            "PAUSE" => Ok(Command::Pause(argument.to_string())),
            "RESUME" => Ok(Command::Resume(argument.to_string())),
            "STOP" => Ok(Command::Stop(argument.to_string())),
            "DELETE" => Ok(Command::Delete(argument.to_string())),
            _ => Err("unknown command"),
        }
    }
}

/// External label for a job state.
///
/// The protocol exposes a coarser lifecycle than the engine tracks: waiting
/// on another job's priority files is just PAUSED to clients, and an errored
/// run reads as STOPPED.
pub fn wire_state(state: JobState) -> &'static str {
    match state {
        JobState::Ready => "READY",
        JobState::Running => "RUNNING",
        JobState::Paused | JobState::PausedForPriority => "PAUSED",
        JobState::Stopped | JobState::Error => "STOPPED",
        JobState::Completed => "COMPLETED",
    }
}

pub fn backup_line(snapshot: &JobSnapshot) -> String {
    format!(
        "BACKUP|{}|{}|{}|{}",
        snapshot.name,
        snapshot.kind.as_str(),
        snapshot.source.display(),
        snapshot.target.display()
    )
}

pub fn state_line(name: &str, state: JobState) -> String {
    format!("STATE|{}|{}", name, wire_state(state))
}

pub fn progress_line(name: &str, percent: u8) -> String {
    format!("PROGRESS|{}|{}", name, percent)
}

pub fn deleted_line(name: &str) -> String {
    format!("DELETED|{}", name)
}

/// One line describing every job, for the legacy snapshot feed.
pub fn snapshot_line(jobs: &[JobSnapshot]) -> String {
    jobs.iter()
        .map(|job| format!("{}|{}|{}", job.name, job.progress, wire_state(job.state)))
        .collect::<Vec<_>>()
        .join(";")
}
