//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound on the per-execution CPU budget (one hour).
const MAX_CPU_SECONDS: u64 = 3600;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_host(config)?;
    validate_plugins(config)?;
    validate_sandbox(config)?;
    validate_audit(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_host(config: &Config) -> ConfigResult<()> {
    semver::Version::parse(&config.host.version).map_err(|e| {
        invalid(
            "host.version",
            format!("'{}' is not a semver version: {e}", config.host.version),
        )
    })?;
    Ok(())
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    let name = &config.plugins.manifest_file;
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return Err(invalid(
            "plugins.manifest_file",
            format!("'{name}' must be a bare file name"),
        ));
    }
    Ok(())
}

fn validate_sandbox(config: &Config) -> ConfigResult<()> {
    let s = &config.sandbox;
    if s.cpu_seconds == 0 || s.cpu_seconds > MAX_CPU_SECONDS {
        return Err(invalid(
            "sandbox.cpu_seconds",
            format!("cpu_seconds must be between 1 and {MAX_CPU_SECONDS}"),
        ));
    }
    if s.memory_bytes == 0 {
        return Err(invalid("sandbox.memory_bytes", "memory_bytes must be positive"));
    }
    Ok(())
}

fn validate_audit(config: &Config) -> ConfigResult<()> {
    if config.audit.capacity == 0 {
        return Err(invalid("audit.capacity", "capacity must be positive"));
    }
    if config.audit.max_age_days == 0 {
        return Err(invalid("audit.max_age_days", "max_age_days must be positive"));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ),
        ));
    }

    let valid_formats = ["compact", "pretty", "json"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        ));
    }

    Ok(())
}
