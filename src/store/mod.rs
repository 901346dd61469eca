//! Durable job state.
//!
//! Two JSON artifacts live in the data directory: `state.json`, a snapshot of
//! every job's last known status, and one `log_<date>.json` per day with a
//! record of each transferred file. Both are written wholesale; readers of
//! either file get a complete, valid document or nothing.

pub mod log;
pub mod status;

pub use log::{LogEntry, LogStore};
pub use status::{StatusEntry, StatusStore};
