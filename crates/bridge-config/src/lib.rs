#![warn(missing_docs)]

//! # bridge-config
//!
//! Configuration loading for the miniapp bridge host.
//!
//! Supports TOML configuration files with `${VAR}` and `${VAR:-default}`
//! environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [bridge]
//! default_timeout_ms = 15000
//! start_retry_delay_ms = 100
//!
//! [instances.notes]
//! command = "/opt/bridge/miniapp-bridge-worker"
//! description = "Notes miniapp"
//!
//! [servers.fs]
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "${HOME}"]
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default deadline for a correlated call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Delay before the single retry when an instance's channel is not registered yet.
pub const DEFAULT_START_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default maximum IPC frame size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    /// Bridge timing and framing overrides.
    #[serde(default)]
    pub bridge: BridgeOverrides,

    /// Sandbox instances launched as worker child processes, keyed by logical id.
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,

    /// External stdio processes relayed by the host, keyed by name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

/// Bridge overrides as they appear in the file. Unset values fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeOverrides {
    /// Default per-call timeout in milliseconds.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    /// Delay in milliseconds before the single transport start retry.
    #[serde(default)]
    pub start_retry_delay_ms: Option<u64>,

    /// Maximum IPC frame size in megabytes for stdio instances.
    #[serde(default)]
    pub max_ipc_message_size_mb: Option<usize>,
}

/// A sandbox instance spawned as a child process.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Command to execute.
    pub command: String,

    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// An external stdio process (typically an MCP server).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Command to execute.
    pub command: String,

    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Resolved runtime settings, with every default applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Deadline applied to calls that do not specify their own.
    pub default_timeout: Duration,
    /// Delay before the single transport start retry.
    pub start_retry_delay: Duration,
    /// Maximum IPC frame size in bytes.
    pub max_ipc_message_size: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_CALL_TIMEOUT,
            start_retry_delay: DEFAULT_START_RETRY_DELAY,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

impl BridgeOverrides {
    /// Fold the overrides into [`BridgeSettings`].
    pub fn to_settings(&self) -> BridgeSettings {
        let mut settings = BridgeSettings::default();
        if let Some(ms) = self.default_timeout_ms {
            settings.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.start_retry_delay_ms {
            settings.start_retry_delay = Duration::from_millis(ms);
        }
        if let Some(bytes) = self.max_ipc_message_size_mb.and_then(frame_limit_bytes) {
            settings.max_ipc_message_size = bytes;
        }
        settings
    }
}

/// Megabytes to bytes, or `None` past what a 4-byte frame length can carry.
fn frame_limit_bytes(mb: usize) -> Option<usize> {
    mb.checked_mul(1024 * 1024)
        .filter(|&bytes| u32::try_from(bytes).is_ok())
}

impl BridgeConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    /// Resolved runtime settings.
    pub fn settings(&self) -> BridgeSettings {
        self.bridge.to_settings()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.default_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "bridge.default_timeout_ms must be greater than 0".into(),
            ));
        }
        match self.bridge.max_ipc_message_size_mb {
            Some(0) => {
                return Err(ConfigError::Invalid(
                    "bridge.max_ipc_message_size_mb must be greater than 0".into(),
                ))
            }
            Some(mb) if frame_limit_bytes(mb).is_none() => {
                return Err(ConfigError::Invalid(format!(
                    "bridge.max_ipc_message_size_mb = {mb} exceeds the 4 GiB frame limit"
                )))
            }
            _ => {}
        }
        for (name, instance) in &self.instances {
            if instance.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "instance '{}': 'command' must not be empty",
                    name
                )));
            }
        }
        for (name, server) in &self.servers {
            if server.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server '{}': 'command' must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Replace `${NAME}` with the value of `NAME`, or with `fallback` for
/// `${NAME:-fallback}` when `NAME` is unset. Unset names without a fallback
/// and unterminated references are kept verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let reference = &after[..end];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        match (std::env::var(name), fallback) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
