use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_HEARTBEAT_SECS: u64 = 5;

/// Settings read from the optional YAML file next to the service.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub service_name: String,
    pub service_version: String,
    pub runtime_version: String,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            service_name: env!("CARGO_PKG_NAME").to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_version: concat!("rust-", env!("CARGO_PKG_RUST_VERSION")).to_string(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

impl ServiceConfig {
    /// Load the file at `path`, falling back to defaults when it does not exist.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed, or
    /// when it carries invalid values.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::parse(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_yaml::from_str(raw)?;
        if config.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs MUST be greater than zero");
        }
        if config.service_name.trim().is_empty() {
            bail!("service_name MUST be non-empty");
        }
        Ok(config)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}
