use super::{Config, ConfigError};

/// Validate a loaded configuration before wiring anything.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let formatter = &config.formatter;

    if formatter.import_path.as_os_str().is_empty() {
        return Err(ConfigError::Invalid(
            "formatter.import_path is required".to_string(),
        ));
    }
    if formatter.output_path.as_os_str().is_empty() {
        return Err(ConfigError::Invalid(
            "formatter.output_path is required".to_string(),
        ));
    }
    if formatter.import_path == formatter.output_path {
        return Err(ConfigError::Invalid(
            "formatter.import_path and formatter.output_path must differ".to_string(),
        ));
    }
    if formatter.import_polling_delay == 0 {
        return Err(ConfigError::Invalid(
            "formatter.import_polling_delay must be positive".to_string(),
        ));
    }
    if config.cache_path.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("cache_path is required".to_string()));
    }
    if config.concurrency.format_threads == 0 {
        return Err(ConfigError::Invalid(
            "concurrency.format_threads must be positive".to_string(),
        ));
    }

    Ok(())
}
