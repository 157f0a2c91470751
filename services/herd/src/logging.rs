//! Log sink setup
//!
//! One `tracing` subscriber per process, installed by the binary. Lines go to
//! stderr, or to an append-only file without ANSI colours when one is
//! configured. `RUST_LOG` overrides the configured level.
//!
//! The stderr sink writes through a private copy of the descriptor taken at
//! start-up, so log lines never enter the pipe that ships a workload's stderr
//! to the master.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use herd_config::LogConfig;
use tracing::Span;
use tracing_subscriber::EnvFilter;

pub fn init(config: &LogConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => {
            let stderr = private_copy(std::io::stderr().as_fd())?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(stderr))
                .try_init()
        }
    }
    .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}

/// Writer on its own descriptor, unaffected by later `dup2` over `fd`
fn private_copy(fd: BorrowedFd<'_>) -> Result<File> {
    let owned = fd
        .try_clone_to_owned()
        .context("Failed to duplicate the log descriptor")?;
    Ok(File::from(owned))
}

/// Span entered by a forked child for the rest of its life
pub fn child_span(rank: u8) -> Span {
    tracing::info_span!("child", rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_copy_outlives_redirection() {
        use nix::unistd::dup2;
        use std::io::{Read, Seek, SeekFrom, Write};
        use std::os::fd::AsRawFd;

        let console = tempfile::tempfile().unwrap();
        let mut pipe_end = tempfile::tempfile().unwrap();
        let mut copy = private_copy(console.as_fd()).unwrap();

        // What output capture does to the original descriptor.
        dup2(pipe_end.as_raw_fd(), console.as_raw_fd()).unwrap();
        copy.write_all(b"log line\n").unwrap();

        let mut captured = String::new();
        pipe_end.seek(SeekFrom::Start(0)).unwrap();
        pipe_end.read_to_string(&mut captured).unwrap();
        assert!(captured.is_empty());

        let mut logged = String::new();
        copy.seek(SeekFrom::Start(0)).unwrap();
        copy.read_to_string(&mut logged).unwrap();
        assert_eq!(logged, "log line\n");
    }

    #[test]
    fn test_file_sink_receives_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herd.log");
        let config = LogConfig {
            file: Some(path.clone()),
            level: "info".to_string(),
        };

        init(&config).unwrap();
        let span = child_span(3);
        let _entered = span.enter();
        tracing::info!("sink check");

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("sink check"));
        assert!(!written.contains("\u{1b}["));

        // A process has one subscriber.
        assert!(init(&config).is_err());
    }
}
