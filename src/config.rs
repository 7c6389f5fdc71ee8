//! Engine Configuration
//!
//! Tunables shared by the engine, the poller and the CLI. Every field has a
//! default, so an empty or missing file is a valid configuration.
//!
//! # Lookup Order
//!
//! 1. An explicit path passed by the caller
//! 2. The `FLOWTRACK_CONFIG` environment variable
//! 3. `flowtrack.yaml` in the working directory
//! 4. Built-in defaults
//!
//! `FLOWTRACK_POLL_INTERVAL_MS` and `FLOWTRACK_LOCAL_EMAIL` override
//! whatever the file says.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "flowtrack.yaml";

/// Lazily-resolved path of the configuration file, if one exists.
pub static DEFAULT_CONFIG_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| {
    if let Ok(path) = std::env::var("FLOWTRACK_CONFIG") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        warn!("FLOWTRACK_CONFIG points to missing file {}", path.display());
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }

    None
});

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Polling cadence per session or run
    pub poll_interval_ms: u64,

    /// Lines of run log fetched per poll
    pub log_tail_lines: usize,

    /// Telemetry older than this is reported as stale
    pub stale_after_ms: u64,

    /// ETAs longer than this are shown as "> Nh"
    pub eta_cap_secs: u64,

    /// Identity of the local participant
    pub local_email: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            log_tail_lines: 500,
            stale_after_ms: 15_000,
            eta_cap_secs: 86_400,
            local_email: None,
        }
    }
}

impl EngineConfig {
    /// Parses a YAML (or JSON) document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Loads a configuration file without applying environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Resolves the configuration following the documented lookup order,
    /// then applies environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| DEFAULT_CONFIG_PATH.clone());

        let mut config = match path {
            Some(path) => {
                debug!("Loading config from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies overrides from a variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("FLOWTRACK_POLL_INTERVAL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.poll_interval_ms = ms,
                Err(_) => warn!("Ignoring invalid FLOWTRACK_POLL_INTERVAL_MS '{}'", raw),
            }
        }
        if let Some(email) = lookup("FLOWTRACK_LOCAL_EMAIL") {
            let email = email.trim();
            if !email.is_empty() {
                self.local_email = Some(email.to_string());
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn eta_cap(&self) -> Duration {
        Duration::from_secs(self.eta_cap_secs)
    }
}
