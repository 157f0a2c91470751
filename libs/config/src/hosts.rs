//! Host list files
//!
//! One host per line, `host` or `host:port`. Blank lines and lines starting
//! with `#` are skipped; surrounding whitespace is trimmed.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub fn read_host_file(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read host file {}", path.display()))?;
    Ok(parse_hosts(&content))
}

pub fn parse_hosts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
