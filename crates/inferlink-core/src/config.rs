//! Settings resolution for `InferLink`.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Global config (`~/.config/inferlink/settings.json` on Linux)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables and CLI arguments (applied by the binary)
//!
//! Files are deep-merged at the JSON level, so a file only needs to carry the
//! keys it overrides. Credentials are never read from or written to a file.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete `InferLink` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub local: LocalSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Relay connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TunnelSettings {
    /// Plain server URL (`http`/`https`); the tunnel URL is derived from it.
    pub server_url: Option<String>,
    /// Explicit tunnel URL (`ws`/`wss`), used verbatim when set.
    pub tunnel_url: Option<String>,
    /// Path appended to the server URL to form the tunnel URL.
    pub tunnel_path: String,
    /// Path of the relay's login endpoint, relative to the server URL.
    pub login_path: String,
    pub heartbeat_secs: u64,
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub max_concurrent_requests: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            tunnel_url: None,
            tunnel_path: "/tunnel".to_string(),
            login_path: "/auth/login".to_string(),
            heartbeat_secs: 30,
            initial_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: None,
            max_concurrent_requests: 4,
            shutdown_grace_secs: 5,
        }
    }
}

/// Local Service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocalSettings {
    /// Base URL of the local HTTP service requests are forwarded to.
    pub url: String,
    /// Per-request timeout for the local service, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8002".to_string(),
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with layered resolution.
///
/// `explicit` is an additional file that must exist when given.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_values(&mut merged, load_config_value(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        merge_values(&mut merged, load_config_value(path)?);
    }

    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Global settings file: `<config dir>/inferlink/settings.json`.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("inferlink").join("settings.json"))
}

fn load_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    debug!(path = %path.display(), "Loaded settings file");
    Ok(value)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value replaces what was there.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
