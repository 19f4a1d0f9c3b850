//! Configuration for agentdeck
//!
//! Read from `~/.agentdeck/config.json`. Every field has a default, so a
//! partial file only overrides what it names and a missing file is fine.

use crate::platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid ready marker {pattern:?}: {source}")]
    Marker {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent binary to launch and to look for in the process table
    pub agent_command: String,
    /// Extra arguments passed to every launched agent
    pub agent_args: Vec<String>,
    /// Quiet period after the last output chunk before re-evaluating
    pub debounce_ms: u64,
    /// Rolling output buffer size per session
    pub buffer_capacity: usize,
    /// Ordered regexes that mark the agent as ready for input
    pub ready_markers: Vec<String>,
    /// Window after injecting input during which "waiting" is ignored
    pub input_suppression_ms: u64,
    /// Window after a hook event during which heuristics are ignored
    pub hook_suppression_ms: u64,
    /// Transcript age after which a session reads as idle
    pub transcript_stale_secs: u64,
    /// Transcript age after which a silent agent reads as waiting
    pub transcript_grace_secs: u64,
    pub transcript_poll_ms: u64,
    /// External process scan interval
    pub scan_interval_ms: u64,
    /// Shared hook event file (defaults to `~/.agentdeck/hooks.jsonl`)
    pub hook_file: Option<PathBuf>,
    /// How long a terminated session stays visible before removal
    pub terminated_linger_ms: u64,
    pub desktop_notifications: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_command: "claude".to_string(),
            agent_args: Vec::new(),
            debounce_ms: 500,
            buffer_capacity: 8 * 1024,
            ready_markers: default_ready_markers(),
            input_suppression_ms: 1500,
            hook_suppression_ms: 2000,
            transcript_stale_secs: 300,
            transcript_grace_secs: 30,
            transcript_poll_ms: 2000,
            scan_interval_ms: 3000,
            hook_file: None,
            terminated_linger_ms: 3000,
            desktop_notifications: true,
        }
    }
}

/// Prompt shapes the agent prints when it hands the turn back.
fn default_ready_markers() -> Vec<String> {
    vec![
        // Interactive prompt glyph alone on the last line, optionally boxed
        r"^\s*[│|]?\s*[>❯›]\s*[│|]?\s*$".to_string(),
        r"(?i)do you want to (proceed|make this edit|create|allow)".to_string(),
        r"(?i)\[y/n\]|\(y/n\)".to_string(),
        r"(?i)esc to cancel".to_string(),
    ]
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        platform::config_dir().join("config.json")
    }

    /// Load from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject ready markers that do not compile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for pattern in &self.ready_markers {
            regex::Regex::new(pattern).map_err(|source| ConfigError::Marker {
                pattern: pattern.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn hook_file_path(&self) -> PathBuf {
        self.hook_file
            .clone()
            .unwrap_or_else(|| platform::config_dir().join("hooks.jsonl"))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn input_suppression(&self) -> Duration {
        Duration::from_millis(self.input_suppression_ms)
    }

    pub fn hook_suppression(&self) -> Duration {
        Duration::from_millis(self.hook_suppression_ms)
    }

    pub fn transcript_poll(&self) -> Duration {
        Duration::from_millis(self.transcript_poll_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn terminated_linger(&self) -> Duration {
        Duration::from_millis(self.terminated_linger_ms)
    }
}
