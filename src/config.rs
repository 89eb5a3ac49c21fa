//! Runtime configuration loading.
//!
//! Values come from an optional TOML file and `MUX_CORE_*` environment
//! variables, with environment variables taking precedence. Invalid values
//! fall back to defaults without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `MUX_CORE_MAX_PHYSICAL_CONTEXTS` | 0 | Slot cap per session (0 = unlimited) |
//! | `MUX_CORE_PREALLOCATE` | 0 | Shared slots created at session start |
//! | `MUX_CORE_LOG_LEVEL` | info | Log filter directive |
//! | `MUX_CORE_LOG_FORMAT` | json | `json` or `pretty` |
//! | `MUX_CORE_LOG_FILE` | unset | Log file path (stderr when unset) |
//!
//! # File Format
//!
//! ```toml
//! [session]
//! max_physical_contexts = 4
//! preallocate = 2
//!
//! [log]
//! format = "pretty"
//! level = "mux_core=debug"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionConfig;
use crate::telemetry::{LogConfig, LogFormat};

/// Errors from reading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("Invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// All configuration for an embedding process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub session: SessionConfig,
    pub log: LogConfig,
}

/// Flat summary of effective values.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub max_physical_contexts: usize,
    pub preallocate: usize,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn apply_env(mut config: EnvConfig) -> EnvConfig {
    config.session.max_physical_contexts =
        parse_usize("MUX_CORE_MAX_PHYSICAL_CONTEXTS", config.session.max_physical_contexts);
    config.session.preallocate = parse_usize("MUX_CORE_PREALLOCATE", config.session.preallocate);
    config.session.preallocate = config.session.effective_preallocate();

    if let Ok(level) = std::env::var("MUX_CORE_LOG_LEVEL") {
        if !level.trim().is_empty() {
            config.log.level = level.trim().to_string();
        }
    }
    if let Ok(format) = std::env::var("MUX_CORE_LOG_FORMAT") {
        config.log.format = format.parse().unwrap_or(config.log.format);
    }
    if let Ok(path) = std::env::var("MUX_CORE_LOG_FILE") {
        if !path.trim().is_empty() {
            config.log.output_path = Some(PathBuf::from(path.trim()));
        }
    }
    config
}

/// Load configuration from environment variables over defaults.
pub fn load() -> EnvConfig {
    apply_env(EnvConfig::default())
}

/// Load configuration from a TOML file, then apply environment overrides.
pub fn load_file(path: impl AsRef<Path>) -> Result<EnvConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let config = from_toml_str(&text).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })?;
    Ok(apply_env(config))
}

fn from_toml_str(text: &str) -> Result<EnvConfig, String> {
    toml::from_str(text).map_err(|e| e.to_string())
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            max_physical_contexts: self.session.max_physical_contexts,
            preallocate: self.session.effective_preallocate(),
            log_level: self.log.level.clone(),
            log_format: self.log.format,
            log_file: self.log.output_path.clone(),
        }
    }
}
