//! Client-side configuration and environment parsing helpers.

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read `var` and parse it, falling back to `default` when unset.
pub(crate) fn env_or<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        }
        Err(_) => Ok(default),
    }
}

/// Where a client finds the authoritative store and the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the REST store, e.g. `http://localhost:5000/api`.
    pub api_url: String,
    /// WebSocket URL of the relay.
    pub socket_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:5000/api".to_string(),
            socket_url: "ws://localhost:5000".to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `CORKBOARD_API_URL` / `CORKBOARD_SOCKET_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            api_url: env_or("CORKBOARD_API_URL", defaults.api_url)?,
            socket_url: env_or("CORKBOARD_SOCKET_URL", defaults.socket_url)?,
        })
    }
}
