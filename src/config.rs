//! Client configuration loaded from the environment.

use std::time::Duration;

pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuctConfig {
    /// Total timeout of the discovery HTTP request.
    pub discovery_timeout_secs: u64,
    /// Timeout of the websocket handshake.
    pub connect_timeout_secs: u64,
    /// `User-Agent` sent with the discovery request.
    pub user_agent: String,
}

impl Default for DuctConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: DEFAULT_DISCOVERY_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            user_agent: String::new(),
        }
    }
}

impl DuctConfig {
    /// Load from `DUCTS_*` environment variables. Unset or unparseable
    /// values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            discovery_timeout_secs: env_parse_u64("DUCTS_DISCOVERY_TIMEOUT_SECS", DEFAULT_DISCOVERY_TIMEOUT_SECS),
            connect_timeout_secs: env_parse_u64("DUCTS_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: std::env::var("DUCTS_USER_AGENT").unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn env_parse_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
