pub mod coordinator;
pub mod copier;
pub mod events;
pub mod gate;
pub mod job;
pub mod manager;
pub mod progress;
pub mod strategy;
pub mod watcher;

pub use coordinator::PriorityCoordinator;
pub use copier::SourceFile;
pub use events::JobEvent;
pub use gate::LargeFileGate;
pub use job::{BackupJob, JobError, JobKind, JobSnapshot, JobState};
pub use manager::JobManager;
pub use progress::ByteProgressTracker;
pub use strategy::BackupStrategy;
