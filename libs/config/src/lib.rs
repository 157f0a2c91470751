//! # Herd Configuration
//!
//! Configuration loading and shared defaults for the herd daemon, client and
//! command-line tool.
//!
//! ## Usage
//!
//! ```no_run
//! use herd_config::{constants, HerdConfig};
//!
//! let config = HerdConfig::load(None).unwrap();
//! assert!(config.channels <= constants::daemon::MAX_DATA_CHANNELS);
//! ```

pub mod hosts;
pub mod constants;
pub mod service_config;

// Re-export commonly used types
pub use hosts::{parse_hosts, read_host_file};
pub use service_config::{load_config, HerdConfig, LogConfig, PingMode, TimeoutConfig, WorkloadConfig};
