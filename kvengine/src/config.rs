//! Engine configuration.
//!
//! Loaded from environment variables; every variable is optional.
//!
//! # Environment Variables
//!
//! - `KVENGINE_ORDER`: maximum entries per node (default: `7`)
//! - `KVENGINE_POOL_BYTES`: key pool bytes per node (default: `2048`)
//! - `KVENGINE_CACHE_BYTES`: byte budget of each node cache (default: 256MB)
//! - `KVENGINE_LOG_LIMIT`: largest log record one commit may write (default: 4MB)
//! - `KVENGINE_SYNC`: fsync during commit and recovery (default: `true`)
//!
//! # Invariants
//!
//! - `order` and `pool_capacity` describe a valid node layout
//! - Node geometry only applies when a data file is created; an existing
//!   file keeps the geometry recorded in its meta page

use std::str::FromStr;

use crate::storage::btree::{DEFAULT_ORDER, DEFAULT_POOL_CAPACITY, NodeLayout};
use crate::storage::logger::{DEFAULT_CACHE_BYTES, LoggerConfig};
use crate::storage::wal::DEFAULT_LOG_SIZE_LIMIT;

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Node geometry for newly created files.
    pub layout: NodeLayout,
    /// Byte budget of each of the meta, internal and leaf caches.
    pub cache_bytes: usize,
    /// Upper bound of a single log record.
    pub log_size_limit: u64,
    /// Fsync the data and log files during commit and recovery.
    pub sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            layout: NodeLayout {
                order: Self::DEFAULT_ORDER,
                pool_capacity: Self::DEFAULT_POOL_BYTES,
            },
            cache_bytes: Self::DEFAULT_CACHE_BYTES,
            log_size_limit: Self::DEFAULT_LOG_LIMIT,
            sync: true,
        }
    }
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    pub const DEFAULT_ORDER: usize = DEFAULT_ORDER;
    pub const DEFAULT_POOL_BYTES: usize = DEFAULT_POOL_CAPACITY;
    pub const DEFAULT_CACHE_BYTES: usize = DEFAULT_CACHE_BYTES;
    pub const DEFAULT_LOG_LIMIT: u64 = DEFAULT_LOG_SIZE_LIMIT;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// resulting node layout is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let layout = NodeLayout {
            order: Self::load("KVENGINE_ORDER", Self::DEFAULT_ORDER)?,
            pool_capacity: Self::load("KVENGINE_POOL_BYTES", Self::DEFAULT_POOL_BYTES)?,
        };
        layout.validate().map_err(|e| ConfigError::InvalidValue {
            name: "KVENGINE_ORDER/KVENGINE_POOL_BYTES".to_string(),
            message: e.to_string(),
        })?;

        let cache_bytes = Self::load("KVENGINE_CACHE_BYTES", Self::DEFAULT_CACHE_BYTES)?;
        if cache_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                name: "KVENGINE_CACHE_BYTES".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            layout,
            cache_bytes,
            log_size_limit: Self::load("KVENGINE_LOG_LIMIT", Self::DEFAULT_LOG_LIMIT)?,
            sync: Self::load_sync()?,
        })
    }

    /// Logger settings derived from this configuration.
    #[must_use]
    pub const fn logger_config(&self) -> LoggerConfig {
        LoggerConfig {
            cache_bytes: self.cache_bytes,
            log_size_limit: self.log_size_limit,
            sync: self.sync,
        }
    }

    /// Load a numeric variable, returning `default` if it is not set.
    fn load<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
        std::env::var(name).map_or(Ok(default), |value| parse_value(name, &value))
    }

    /// Load `KVENGINE_SYNC`.
    ///
    /// Accepts `true`/`false`, `1`/`0`, `yes`/`no`, `on`/`off`.
    fn load_sync() -> Result<bool, ConfigError> {
        std::env::var("KVENGINE_SYNC").map_or(Ok(true), |value| parse_bool("KVENGINE_SYNC", &value))
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a valid number"),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.layout.order, 7);
        assert_eq!(config.layout.pool_capacity, 2048);
        assert_eq!(config.cache_bytes, 256 * 1024 * 1024);
        assert_eq!(config.log_size_limit, 4 * 1024 * 1024);
        assert!(config.sync);
        assert!(config.layout.validate().is_ok());
        assert_eq!(config.logger_config(), LoggerConfig::default());
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value::<usize>("N", " 64 "), Ok(64));
        assert_eq!(
            parse_value::<usize>("N", "lots"),
            Err(ConfigError::InvalidValue {
                name: "N".to_string(),
                message: "'lots' is not a valid number".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("S", "TRUE"), Ok(true));
        assert_eq!(parse_bool("S", "off"), Ok(false));
        assert!(parse_bool("S", "maybe").is_err());
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
