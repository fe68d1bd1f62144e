//! Configuration management for turborack.
//!
//! This module defines the structure of the optional `turborack.toml` file and
//! provides functionality to load and parse it. Every key is optional; command
//! line flags take precedence over it.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// File name looked up in the workspace root.
pub const CONFIG_FILE: &str = "turborack.toml";

/// Top-level configuration structure corresponding to `turborack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Maximum number of console lines kept per package.
    pub max_lines: Option<usize>,
    /// Whether to use Unicode symbols in the TUI (default: true).
    pub symbols: Option<bool>,
    /// Start every package once the first discovery pass completes.
    pub start_all: Option<bool>,
    /// Time to wait after SIGINT before escalating (ms).
    pub shutdown_sigint_ms: Option<u64>,
    /// Time to wait after SIGTERM before killing (ms).
    pub shutdown_sigterm_ms: Option<u64>,
    /// File receiving log records while the TUI is active.
    pub log_file: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
