//! Configuration loading for bus endpoints.
//!
//! Settings are read from `config.json` in the netbus configuration
//! directory, then individual fields are overridden from `NETBUS_*`
//! environment variables. A missing file is not an error: defaults apply.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_CLIENTS,
    DEFAULT_READ_BUFFER_SIZE,
};

/// Tunables shared by clients and servers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of each socket's staging read buffer, in bytes.
    pub read_buffer_size: usize,
    /// Bound on each handshake-phase read, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Bound on each read in the message loop. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    /// Largest accepted message body, in bytes.
    pub max_body_size: u32,
    /// Maximum simultaneously connected clients (server only).
    pub max_clients: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            idle_timeout_ms: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

impl BusConfig {
    /// Returns the configuration directory.
    ///
    /// `NETBUS_CONFIG_DIR` takes priority; otherwise the platform config
    /// directory (`~/.config/netbus` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("NETBUS_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("netbus"))
    }

    /// Loads configuration from the default location with env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from an explicit file, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Writes the configuration as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(size) = env_parse::<usize>("NETBUS_READ_BUFFER_SIZE") {
            self.read_buffer_size = size;
        }
        if let Some(ms) = env_parse::<u64>("NETBUS_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("NETBUS_IDLE_TIMEOUT_MS") {
            // Zero disables the idle bound.
            self.idle_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(size) = env_parse::<u32>("NETBUS_MAX_BODY_SIZE") {
            self.max_body_size = size;
        }
        if let Some(max) = env_parse::<u32>("NETBUS_MAX_CLIENTS") {
            self.max_clients = max;
        }
    }

    /// Handshake read bound as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Message-loop read bound, if any.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[Config] Ignoring unparseable {key}={raw}");
            None
        }
    }
}
