//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading or validating `gangway.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config must contain at least one service or scheduled task")]
    NoUnits,

    #[error("unit name {0:?} is used by both a service and a scheduled task")]
    DuplicateUnit(String),

    #[error("{unit}: {field} must not be empty")]
    Empty { unit: String, field: &'static str },

    #[error("{unit}: invalid {field} {value:?}: {reason}")]
    InvalidEndpoint {
        unit: String,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("check_interval ({interval}) must be shorter than timeout ({timeout})")]
    IntervalNotBelowTimeout { interval: String, timeout: String },

    #[error("target version must not be empty")]
    EmptyVersion,
}
