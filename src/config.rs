//! Configuration
//!
//! Plain serde structures. Every field has a default, so an empty JSON
//! object is a valid configuration. Durations are stored as milliseconds.

use crate::postoffice::office::{DEBUG_MAILBOX_LIFETIME, DEFAULT_MAILBOX_LIFETIME};
use crate::remoting::client::RpcTimeouts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Health ping settings for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Score at or below which a container is unhealthy.
    pub failure_threshold: f64,
    /// Samples in the moving average.
    pub window: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { enabled: true, interval_ms: 1000, timeout_ms: 1000, failure_threshold: 0.2, window: 50 }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How a host talks to its guests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotingConfig {
    pub protocol: String,
    pub dedicated_reader: bool,
    pub debug_timeouts: bool,
    /// Overrides the idle lifetime of transient mailboxes.
    pub mailbox_lifetime_ms: Option<u64>,
    pub startup_timeout_ms: u64,
    pub keepalive: KeepaliveConfig,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            protocol: "json".to_string(),
            dedicated_reader: false,
            debug_timeouts: false,
            mailbox_lifetime_ms: None,
            startup_timeout_ms: 10_000,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl RemotingConfig {
    pub fn mailbox_lifetime(&self) -> Duration {
        match self.mailbox_lifetime_ms {
            Some(ms) => Duration::from_millis(ms),
            None if self.debug_timeouts => DEBUG_MAILBOX_LIFETIME,
            None => DEFAULT_MAILBOX_LIFETIME,
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn rpc_timeouts(&self) -> RpcTimeouts {
        RpcTimeouts::for_debug_mode(self.debug_timeouts)
    }
}

/// Top-level settings for a [`crate::container::ContainerSupervisor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub remoting: RemotingConfig,
    pub plugin_directory: PathBuf,
    pub environment_root: PathBuf,
    /// Folder holding `<version>-<framework>` runtime installs.
    pub runtime_directory: Option<PathBuf>,
    pub preferred_runtime: String,
    /// Empty means every discovered family is allowed.
    pub allowed_runtimes: Vec<String>,
    pub metric_dimensions: BTreeMap<String, String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            remoting: RemotingConfig::default(),
            plugin_directory: PathBuf::from("plugins"),
            environment_root: PathBuf::from("."),
            runtime_directory: None,
            preferred_runtime: "native".to_string(),
            allowed_runtimes: Vec::new(),
            metric_dimensions: BTreeMap::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&text)
    }
}
