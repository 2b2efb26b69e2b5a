use std::time::Duration;

use crate::sync::lock_table::LockMode;

pub type Result<T, E = LockError> = std::result::Result<T, E>;

/// The only way a lock request fails. Recoverable: nothing is held and no state is corrupted,
/// so the caller may retry or report the resource as busy.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("{mode} lock on `{key}` for `{holder}` timed out after {waited:?}")]
    Timeout {
        holder: String,
        key: String,
        mode: LockMode,
        waited: Duration,
    },
}

/// Errors loading a [`CoordinatorConfig`](crate::config::CoordinatorConfig).
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
