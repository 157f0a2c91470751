//! # Herd
//!
//! Daemons, one per machine, that a client assembles into a fully connected
//! group. Once grouped, every daemon forks: the parent supervises, the child
//! runs a workload with its stdout and stderr shipped back to the client.
//!
//! ```text
//! client ──Enslave/Peers/ConnectTo/Grouped/Run──> daemon ──fork──> child (workload)
//!    ^                                                               │
//!    └──────────────────────── Output / Done ────────────────────────┘
//! ```

pub mod client;
pub mod daemon;
pub mod exchange;
pub mod logging;
pub mod status;
pub mod workload;

pub use client::{Client, OutputSink};
pub use daemon::{Context, Daemon, Entry};
pub use status::{DaemonState, DaemonStatus};
