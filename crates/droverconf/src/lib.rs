//! Configuration loading for drover.
//!
//! Drover is configured from one or more JSON files given on the command
//! line. Files are parsed into a single tree; later files win, with maps
//! merged key by key so a site override file can patch a single device
//! without restating the whole fleet.
//!
//! The tree has three well-known sections:
//!
//! - `/config` - reactor and HTTP parameters ([`ServerConfig`])
//! - `/devicetypes/<name>` - device templates shared by many devices
//! - `/devices/<name>` - device instances referring to a template
//!
//! Device and template sections are kept as raw [`serde_json::Value`]s:
//! arbitrary keys flow through untouched so device scripts can read their
//! own settings from the `CONFIG` global.
//!
//! Durations are strings of concatenated `<int><unit>` pairs with units
//! `ms|s|m|h|d`, e.g. `"1m30s"`. See [`duration::parse_duration_ms`].

pub mod duration;
pub mod tree;

pub use duration::{duration_value_ms, parse_duration_ms};
pub use tree::{load_files, merge_values};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("bad duration {input:?}: {message}")]
    Duration { input: String, message: String },

    #[error("config key {key}: {message}")]
    Invalid { key: String, message: String },
}

/// One HTTP listen address from `/config/listen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
}

/// The `/config` section of the tree.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on the reactor poll timeout, in milliseconds.
    pub idle_wait_time_ms: u64,

    /// HTTP listen addresses.
    pub listen: Vec<ListenAddr>,

    /// HTTP worker threads. `None` means use the platform default
    /// (the daemon picks 2x CPUs, minimum 5).
    pub listen_threads: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_wait_time_ms: 100,
            listen: Vec::new(),
            listen_threads: None,
        }
    }
}

impl ServerConfig {
    /// Extract the `/config` section from a merged tree.
    ///
    /// A missing section yields the defaults; a present-but-malformed one
    /// is an error so typos fail startup instead of being ignored.
    pub fn from_tree(tree: &Value) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let Some(section) = tree.get("config") else {
            return Ok(cfg);
        };
        let Some(map) = section.as_object() else {
            return Err(ConfigError::Invalid {
                key: "/config".into(),
                message: "expected an object".into(),
            });
        };

        if let Some(v) = map.get("idle_wait_time") {
            cfg.idle_wait_time_ms = duration_value_ms(v).map_err(|e| ConfigError::Invalid {
                key: "/config/idle_wait_time".into(),
                message: e.to_string(),
            })?;
        }

        if let Some(v) = map.get("listen_threads") {
            let n = v.as_u64().ok_or_else(|| ConfigError::Invalid {
                key: "/config/listen_threads".into(),
                message: "expected an integer".into(),
            })?;
            cfg.listen_threads = Some(n as usize);
        }

        if let Some(v) = map.get("listen") {
            cfg.listen =
                serde_json::from_value(v.clone()).map_err(|e| ConfigError::Invalid {
                    key: "/config/listen".into(),
                    message: e.to_string(),
                })?;
        }

        Ok(cfg)
    }
}
