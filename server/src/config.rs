//! Configuration management for the server.

use std::env;

/// Completed method outcomes kept for resends, unless configured.
pub const DEFAULT_RESULT_CACHE_CAPACITY: usize = 1024;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Shared secret for bearer tokens; anonymous connections are
    /// rejected when set
    pub auth_secret: Option<String>,
    /// Completed method outcomes remembered per server
    pub result_cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            auth_secret: None,
            result_cache_capacity: DEFAULT_RESULT_CACHE_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);

        let port = match lookup("PORT") {
            Some(port) => port.parse::<u16>().map_err(|_| ConfigError::InvalidPort(port))?,
            None => defaults.port,
        };

        let auth_secret = lookup("AUTH_SECRET").filter(|secret| !secret.is_empty());

        let result_cache_capacity = match lookup("RESULT_CACHE_CAPACITY") {
            Some(value) => match value.parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => return Err(ConfigError::InvalidCacheCapacity(value)),
            },
            None => defaults.result_cache_capacity,
        };

        Ok(Self {
            host,
            port,
            auth_secret,
            result_cache_capacity,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value: {0}")]
    InvalidPort(String),

    #[error("Invalid RESULT_CACHE_CAPACITY value: {0}")]
    InvalidCacheCapacity(String),
}
