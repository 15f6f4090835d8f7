use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{NetworkError, Result};

/// Tunables of one connection
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    /// Upper bound on how long `close()` waits for pending requests
    pub drain_timeout: Duration,
    /// Deadline applied to every invocation unless overridden; `None` waits forever
    pub invoke_timeout: Option<Duration>,
    /// Deadline applied to discovery lookups; `None` waits forever
    pub discovery_timeout: Option<Duration>,
}

fn env_millis(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok())
}

// 0 disables an optional deadline
fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_millis(env_millis("ENAV_DRAIN_TIMEOUT_MS").unwrap_or(5_000)),
            invoke_timeout: optional_millis(env_millis("ENAV_INVOKE_TIMEOUT_MS").unwrap_or(30_000)),
            discovery_timeout: optional_millis(env_millis("ENAV_DISCOVERY_TIMEOUT_MS").unwrap_or(0)),
        }
    }
}

impl ConnectionConfig {
    /// Load configuration from a TOML file (path via ENAV_CONFIG or ./enav.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("ENAV_CONFIG").unwrap_or_else(|_| "enav.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<ConnectionToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Parses a TOML document and overlays it onto the defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let parsed = toml::from_str::<ConnectionToml>(s)
            .map_err(|e| NetworkError::Config(e.to_string()))?;
        Ok(parsed.overlay(Self::default()))
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.discovery_timeout = timeout;
        self
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectionToml {
    pub drain_timeout_ms: Option<u64>,
    pub invoke_timeout_ms: Option<u64>,
    pub discovery_timeout_ms: Option<u64>,
}

impl ConnectionToml {
    fn overlay(self, mut base: ConnectionConfig) -> ConnectionConfig {
        if let Some(ms) = self.drain_timeout_ms {
            base.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.invoke_timeout_ms {
            base.invoke_timeout = optional_millis(ms);
        }
        if let Some(ms) = self.discovery_timeout_ms {
            base.discovery_timeout = optional_millis(ms);
        }
        base
    }
}
