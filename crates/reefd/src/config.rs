//! TOML configuration for the offload proxy daemon.
//!
//! The same file may carry the client's `[offload]` table; the daemon only
//! reads it for `check-config`.

use std::path::Path;

use reef_offload::OffloadConfig;
use reef_offload::config::keys;
use serde::Deserialize;

/// Default proxy listen address, matching the client's default provider.
pub const DEFAULT_LISTEN_ADDR: &str = reef_offload::config::DEFAULT_PROVIDER_ADDR;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listener and served endpoints.
    pub server: ServerSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[server]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to accept channel connections on.
    pub listen_addr: String,
    /// Endpoints this proxy answers for. Empty accepts any name.
    pub endpoints: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            endpoints: Vec::new(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Resolved client settings as `(key, value)` lines.
pub fn describe_offload(config: &OffloadConfig) -> Vec<(&'static str, String)> {
    vec![
        (keys::ENABLED, config.enabled.to_string()),
        (keys::MOCK, config.mock.to_string()),
        (keys::PROVIDER_ADDR, config.provider_addr.clone()),
        (keys::ENDPOINTS, config.endpoints.join(",")),
        (
            keys::RECEIVE_TIMEOUT_MILLIS,
            config.receive_timeout.as_millis().to_string(),
        ),
        (
            keys::CONNECT_TIMEOUT_MILLIS,
            config.connect_timeout.as_millis().to_string(),
        ),
        (
            keys::PERSISTENT_DELIVERY,
            config.delivery.persistent.to_string(),
        ),
        (keys::MESSAGE_PRIORITY, config.delivery.priority.to_string()),
        (
            keys::MESSAGE_TTL_MILLIS,
            config.delivery.time_to_live_ms.to_string(),
        ),
    ]
}
