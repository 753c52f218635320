//! Engine error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building the engine from configuration.
///
/// All of these abort startup; the daemon prints one line and exits.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] droverconf::ConfigError),

    #[error("device type {device}: {message}")]
    Template { device: String, message: String },

    #[error("device type {device}: {source}")]
    Action {
        device: String,
        #[source]
        source: crate::action::ParseError,
    },

    #[error("device {device}: {message}")]
    Device { device: String, message: String },

    #[error("script {path}: {message}")]
    Script { path: PathBuf, message: String },
}

/// Errors returned by the request bridge to an HTTP worker.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("not yet connected to device, wait a little...")]
    NotReady,

    #[error("action aborted")]
    Aborted,
}

impl QueryError {
    /// The HTTP status this error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            QueryError::UnknownClient(_) | QueryError::UnknownAction(_) => 404,
            QueryError::NotReady => 503,
            QueryError::Aborted => 500,
        }
    }
}
