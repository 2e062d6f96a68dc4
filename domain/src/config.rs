//! Centralized configuration for the registries.
//!
//! Environment variables are read once into typed fields. Paths fall back to
//! the current directory; the connection string is left unvalidated so that a
//! missing value only fails on the first pooled connection.

use std::env;
use std::fmt;
use std::path::PathBuf;

use serde_json::json;

use crate::pool::CONNECTION_STRING_ENV;
use crate::CoreError;

pub const MODELS_ROOT_ENV: &str = "DOCFIX_MODELS_ROOT";
pub const FIXTURES_DIR_ENV: &str = "DOCFIX_FIXTURES_DIR";
pub const SQLITE_ROOT_ENV: &str = "DOCFIX_SQLITE_ROOT";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::validation(err.to_string(), json!({ "field": err.field }))
    }
}

/// Registry configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URI for the connection pools
    pub connection_string: Option<String>,
    /// Root of the `*.model.json` search (default: current dir)
    pub models_root: PathBuf,
    /// Fixture tree root (default: `<cwd>/test/fixtures`)
    pub fixtures_dir: PathBuf,
    /// Directory for SQLite databases; enables the `sqlite` scheme when set
    pub sqlite_root: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let cwd = env::current_dir().map_err(|e| ConfigError {
            field: "current_dir",
            message: format!("Cannot resolve working directory: {}", e),
        })?;

        let connection_string = var(CONNECTION_STRING_ENV);

        let models_root = var(MODELS_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.clone());

        let fixtures_dir = var(FIXTURES_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.join("test").join("fixtures"));

        let sqlite_root = var(SQLITE_ROOT_ENV).map(PathBuf::from);
        if let Some(root) = &sqlite_root {
            if root.is_file() {
                return Err(ConfigError {
                    field: SQLITE_ROOT_ENV,
                    message: format!("'{}' is a file, expected a directory", root.display()),
                });
            }
        }

        let log_format = LogFormat::from_str(&var(LOG_FORMAT_ENV).unwrap_or_else(|| "pretty".into()));

        Ok(Self {
            connection_string,
            models_root,
            fixtures_dir,
            sqlite_root,
            log_format,
        })
    }

    /// Log warnings about settings that will only fail later.
    pub fn warn_if_unconfigured(&self) {
        if self.connection_string.is_none() {
            tracing::warn!(
                "{} not set: model registration will fail on the first connection.",
                CONNECTION_STRING_ENV
            );
        }
        if !self.fixtures_dir.is_dir() {
            tracing::warn!(
                dir = %self.fixtures_dir.display(),
                "fixtures directory does not exist; no fixtures will be loaded"
            );
        }
    }
}
