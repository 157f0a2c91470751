//! Service Configuration Module
//!
//! Loads the operating parameters of a daemon or client. Sources are layered,
//! later ones overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. `HERD_*` environment variables (`HERD_PORT`, `HERD_LOG__LEVEL`, ...)
//!
//! Command-line flags are applied on top by the binary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::hosts::read_host_file;
use crate::constants::{daemon, network, workload};

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct HerdConfig {
    /// Port daemons listen on and clients connect to
    pub port: u16,

    /// Display name announced to peers; the host name when unset
    pub name: Option<String>,

    /// Daemons to enslave, as `host` or `host:port`
    pub hosts: Vec<String>,

    /// File with one host per line, appended to `hosts`
    pub host_file: Option<PathBuf>,

    /// Data channels between every pair of peers
    pub channels: usize,

    pub workload: WorkloadConfig,
    pub log: LogConfig,
    pub timeouts: TimeoutConfig,
}

/// Parameters handed to the demonstration workloads
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkloadConfig {
    pub work_load: usize,
    pub selection: u32,
    /// Concurrent ping workers per rank
    pub threads: usize,
    pub mode: PingMode,
}

/// Where ping answers travel back
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PingMode {
    /// Every worker shares the control lane and a dispatcher routes answers
    #[default]
    Shared,
    /// Worker `i` gets its answers on data line `i`
    Dedicated,
}

impl PingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Dedicated => "dedicated",
        }
    }
}

impl fmt::Display for PingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" => Ok(Self::Shared),
            "dedicated" => Ok(Self::Dedicated),
            other => bail!("unknown ping mode '{}' (shared or dedicated)", other),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Append log lines here instead of stderr
    pub file: Option<PathBuf>,
    pub level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub io_ms: u64,
    pub poll_ms: u64,
    pub child_grace_ms: u64,
}

impl Default for HerdConfig {
    fn default() -> Self {
        Self {
            port: network::DEFAULT_PORT,
            name: None,
            hosts: Vec::new(),
            host_file: None,
            channels: daemon::DEFAULT_DATA_CHANNELS,
            workload: WorkloadConfig::default(),
            log: LogConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            work_load: workload::DEFAULT_WORK_LOAD,
            selection: workload::DEFAULT_SELECTION,
            threads: workload::DEFAULT_THREADS,
            mode: PingMode::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: "info".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: network::CONNECTION_TIMEOUT_MS,
            io_ms: network::IO_TIMEOUT_MS,
            poll_ms: daemon::POLL_INTERVAL_MS,
            child_grace_ms: daemon::CHILD_GRACE_MS,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Channel I/O timeout; zero disables it
    pub fn io(&self) -> Option<Duration> {
        (self.io_ms > 0).then(|| Duration::from_millis(self.io_ms))
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn child_grace(&self) -> Duration {
        Duration::from_millis(self.child_grace_ms)
    }
}

impl HerdConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading configuration: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (HERD_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("HERD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let mut config: HerdConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.expand_env_vars()?;
        config.validate()?;
        debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// Expand `~` and environment variables in path values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        if let Some(file) = &self.log.file {
            let expanded = shellexpand::full(&file.to_string_lossy())
                .context("Failed to expand log file path")?
                .to_string();
            self.log.file = Some(PathBuf::from(expanded));
        }
        if let Some(file) = &self.host_file {
            let expanded = shellexpand::full(&file.to_string_lossy())
                .context("Failed to expand host file path")?
                .to_string();
            self.host_file = Some(PathBuf::from(expanded));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels > daemon::MAX_DATA_CHANNELS {
            bail!(
                "channels = {} exceeds the limit of {}",
                self.channels,
                daemon::MAX_DATA_CHANNELS
            );
        }
        if self.workload.threads == 0 {
            bail!("workload.threads must be positive");
        }
        if self.workload.mode == PingMode::Dedicated && self.workload.threads > self.channels {
            bail!(
                "dedicated ping needs a data channel per thread: threads = {}, channels = {}",
                self.workload.threads,
                self.channels
            );
        }
        if self.timeouts.poll_ms == 0 {
            bail!("timeouts.poll_ms must be positive");
        }
        if self.timeouts.connect_ms == 0 {
            bail!("timeouts.connect_ms must be positive");
        }
        Ok(())
    }

    /// Configured hosts followed by the entries of the host file
    pub fn resolved_hosts(&self) -> Result<Vec<String>> {
        let mut hosts = self.hosts.clone();
        if let Some(file) = &self.host_file {
            hosts.extend(read_host_file(file)?);
        }
        Ok(hosts)
    }

    /// Effective configuration rendered as TOML, loadable again with [`HerdConfig::load`]
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Convenience function to load configuration with defaults
pub fn load_config(path: Option<&Path>) -> Result<HerdConfig> {
    HerdConfig::load(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = HerdConfig::default();
        assert_eq!(config.port, 41813);
        assert_eq!(config.channels, 1);
        assert_eq!(config.timeouts.io(), Some(Duration::from_secs(480)));
        assert_eq!(config.log.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_load_base_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("herd.toml");

        let config_content = r#"
port = 9100
hosts = ["alpha", "beta:9200"]
channels = 3

[workload]
work_load = 50
selection = 2
threads = 3
mode = "dedicated"

[log]
level = "debug"

[timeouts]
poll_ms = 250
io_ms = 0
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = HerdConfig::load(Some(&config_path)).unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.hosts, vec!["alpha", "beta:9200"]);
        assert_eq!(config.channels, 3);
        assert_eq!(config.workload.work_load, 50);
        assert_eq!(config.workload.selection, 2);
        assert_eq!(config.workload.threads, 3);
        assert_eq!(config.workload.mode, PingMode::Dedicated);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.timeouts.poll(), Duration::from_millis(250));
        assert_eq!(config.timeouts.io(), None);
        assert_eq!(config.timeouts.connect_ms, network::CONNECTION_TIMEOUT_MS);
    }

    #[test]
    fn test_host_file_is_appended() {
        let dir = tempdir().unwrap();
        let hosts_path = dir.path().join("hosts");
        fs::write(&hosts_path, "# lab machines\ngamma\n\ndelta:7000\n").unwrap();

        let config = HerdConfig {
            hosts: vec!["alpha".into()],
            host_file: Some(hosts_path),
            ..HerdConfig::default()
        };
        assert_eq!(
            config.resolved_hosts().unwrap(),
            vec!["alpha", "gamma", "delta:7000"]
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = HerdConfig {
            channels: 1000,
            ..HerdConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = HerdConfig::default();
        config.timeouts.poll_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HerdConfig::default();
        config.workload.threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dedicated_ping_needs_a_line_per_thread() {
        let mut config = HerdConfig {
            channels: 2,
            ..HerdConfig::default()
        };
        config.workload.mode = PingMode::Dedicated;
        config.workload.threads = 2;
        config.validate().unwrap();

        config.workload.threads = 3;
        assert!(config.validate().is_err());

        config.workload.mode = PingMode::Shared;
        config.validate().unwrap();
    }

    #[test]
    fn test_ping_mode_names() {
        assert_eq!("shared".parse::<PingMode>().unwrap(), PingMode::Shared);
        assert_eq!("dedicated".parse::<PingMode>().unwrap(), PingMode::Dedicated);
        assert!("Dedicated".parse::<PingMode>().is_err());
        assert_eq!(PingMode::Dedicated.to_string(), "dedicated");
    }

    #[test]
    fn test_rendered_config_loads_back() {
        let mut config = HerdConfig::default();
        config.port = 9300;
        config.hosts = vec!["alpha".into(), "beta".into()];
        config.workload.selection = 3;

        let dir = tempdir().unwrap();
        let path = dir.path().join("rendered.toml");
        fs::write(&path, config.to_toml().unwrap()).unwrap();
        assert_eq!(HerdConfig::load(Some(&path)).unwrap(), config);
    }
}
