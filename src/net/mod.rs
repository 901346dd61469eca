//! Remote control surface.
//!
//! Two line-oriented TCP listeners, both optional to connect to:
//!
//! - `server`: the command/broadcast protocol. Clients send commands
//!   (`START|docs`), every connected client receives job lifecycle
//!   broadcasts.
//! - `snapshot`: a write-only feed that repeats the state of all jobs once
//!   a second for legacy monitors.
//!
//! `protocol` defines the line formats shared by both, `client` is the
//! counterpart used by the `ctl` subcommand.

pub mod client;
pub mod protocol;
mod server;
mod snapshot;

pub use client::ControlClient;
pub use server::ControlServer;
pub use snapshot::SnapshotServer;
