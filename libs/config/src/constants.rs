//! Configuration defaults
//!
//! Default values and limits shared by the daemon, the client and the CLI.

/// Network defaults
pub mod network {
    /// Port daemons listen on when none is configured
    pub const DEFAULT_PORT: u16 = 41813;

    /// Outbound connect timeout (milliseconds)
    pub const CONNECTION_TIMEOUT_MS: u64 = 30_000;

    /// Send/receive timeout on established channels (milliseconds)
    pub const IO_TIMEOUT_MS: u64 = 8 * 60 * 1_000;
}

/// Daemon defaults
pub mod daemon {
    /// Upper bound of one event loop wait (milliseconds)
    pub const POLL_INTERVAL_MS: u64 = 1_000;

    /// Time a forked child gets between SIGTERM and SIGKILL (milliseconds)
    pub const CHILD_GRACE_MS: u64 = 2_000;

    /// Data channels opened between each pair of peers
    pub const DEFAULT_DATA_CHANNELS: usize = 1;

    /// Largest data channel count a group may request
    pub const MAX_DATA_CHANNELS: usize = 64;
}

/// Workload defaults
pub mod workload {
    /// Requests each rank issues in the ping benchmark
    pub const DEFAULT_WORK_LOAD: usize = 10_000;

    /// Recipient selection strategy (1 = next rank)
    pub const DEFAULT_SELECTION: u32 = 1;

    /// Ping workers per rank
    pub const DEFAULT_THREADS: usize = 1;
}
