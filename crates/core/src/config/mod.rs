//! Daemon configuration.
//!
//! Merged from an on-disk YAML file and a `THEA_`-prefixed environment
//! overlay (`THEA_FORMATTER__IMPORT_PATH=...` style nesting).

mod loader;
mod types;
mod validate;

pub use loader::{default_config_path, load_config, load_config_from_str};
pub use types::{
    ConcurrencyConfig, Config, DatabaseConfig, FormatterConfig, LogLevel,
};
pub use validate::validate_config;

use thiserror::Error;

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("config file not found: {0}")]
    FileNotFound(String),

    /// The config file or environment overlay could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// A recognized option carried an unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),
}
