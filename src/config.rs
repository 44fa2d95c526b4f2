//! Configuration loading.
//!
//! Settings come from, in increasing priority: built-in defaults, an
//! optional JSON file, `WSCONSOLE_*` environment variables, and finally
//! command-line flags (applied by `main`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    BACKEND_CONNECT_TIMEOUT, DEFAULT_PORT, MAX_HEADER_BYTES, MAX_PAYLOAD_BYTES, POLL_INTERVAL,
};

/// Configuration for the console proxy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Interface to listen on.
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Upper bound on one readiness poll, in milliseconds.
    pub poll_interval_ms: u64,
    /// Cap on the buffered upgrade request.
    pub max_header_bytes: usize,
    /// Cap on a frame or reassembled message payload.
    pub max_payload_bytes: usize,
    /// Timeout for connecting to a backend, in seconds.
    pub backend_connect_timeout_secs: u64,
    /// Tell other clients when a peer connects or disconnects.
    pub announce_peers: bool,
    /// Token to backend URL (`ws://...` or `tcp://host:port`).
    pub targets: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            max_header_bytes: MAX_HEADER_BYTES,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            backend_connect_timeout_secs: BACKEND_CONNECT_TIMEOUT.as_secs(),
            announce_peers: false,
            targets: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply `WSCONSOLE_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("WSCONSOLE_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("WSCONSOLE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => log::warn!("Ignoring invalid WSCONSOLE_PORT: {port}"),
            }
        }

        if let Some(interval) = lookup("WSCONSOLE_POLL_INTERVAL_MS") {
            match interval.parse::<u64>() {
                Ok(ms) => self.poll_interval_ms = ms,
                Err(_) => log::warn!("Ignoring invalid WSCONSOLE_POLL_INTERVAL_MS: {interval}"),
            }
        }

        if let Some(announce) = lookup("WSCONSOLE_ANNOUNCE") {
            self.announce_peers = matches!(announce.as_str(), "1" | "true" | "yes");
        }
    }

    /// `host:port` for binding.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Poll bound as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backend connect timeout as a duration.
    pub fn backend_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_connect_timeout_secs)
    }

    /// Reject settings the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_header_bytes == 0 || self.max_payload_bytes == 0 {
            anyhow::bail!("max_header_bytes and max_payload_bytes must be non-zero");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be non-zero");
        }
        if self.backend_connect_timeout_secs == 0 {
            anyhow::bail!("backend_connect_timeout_secs must be non-zero");
        }
        Ok(())
    }
}
