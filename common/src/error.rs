//! Error taxonomy shared by every fortress crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::audit::AuditError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, rejected before any side effect took place.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// The guarding rate limiter refused the action. Retry after the window.
    #[error("rate limit exceeded for {0}")]
    RateLimitExceeded(&'static str),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Too many scans are in flight on this mapper.
    #[error("scan refused: {active} scans already in flight (max {max})")]
    ScanBusy { active: usize, max: usize },

    #[error("scan on {interface} failed: {reason}")]
    ScanFailed { interface: String, reason: String },

    #[error("invalid plugin {source_path}: {reason}")]
    InvalidPlugin { source_path: PathBuf, reason: String },

    #[error("plugin '{plugin}' failed during {phase}: {reason}")]
    PluginExecution {
        plugin: String,
        phase: &'static str,
        reason: String,
    },

    #[error("plugin '{0}' is not registered")]
    UnknownPlugin(String),

    #[error("illegal transition for {subject}: {from} -> {to}")]
    IllegalTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub fn plugin_execution(
        plugin: impl Into<String>,
        phase: &'static str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::PluginExecution {
            plugin: plugin.into(),
            phase,
            reason: reason.to_string(),
        }
    }

    /// Errors that end the active run instead of being absorbed by a stage.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Audit(e) if e.is_fatal())
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimitExceeded(_))
    }
}
