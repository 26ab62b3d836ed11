//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::{RuntimeConfig, StateBackendKind};

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Validate a merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &RuntimeConfig) -> ConfigResult<()> {
    validate_discovery(config)?;
    validate_integrity(config)?;
    validate_state(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_discovery(config: &RuntimeConfig) -> ConfigResult<()> {
    let name = &config.discovery.manifest_file;
    if name.trim().is_empty() {
        return Err(invalid("discovery.manifest_file", "must not be empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid(
            "discovery.manifest_file",
            format!("'{name}' must be a bare file name"),
        ));
    }
    if config
        .discovery
        .roots
        .iter()
        .any(|root| root.as_os_str().is_empty())
    {
        return Err(invalid("discovery.roots", "roots must not be empty paths"));
    }
    Ok(())
}

fn validate_integrity(config: &RuntimeConfig) -> ConfigResult<()> {
    for (i, entry) in config.integrity.trusted_keys.iter().enumerate() {
        if entry.public_key.trim().is_empty() {
            return Err(invalid(
                &format!("integrity.trusted_keys[{i}].public_key"),
                "must not be empty",
            ));
        }
    }
    Ok(())
}

fn validate_state(config: &RuntimeConfig) -> ConfigResult<()> {
    if config.state.backend == StateBackendKind::File && config.state.directory.is_none() {
        return Err(invalid(
            "state.directory",
            "required when state.backend = \"file\"",
        ));
    }
    Ok(())
}

fn validate_logging(config: &RuntimeConfig) -> ConfigResult<()> {
    let level = config.logging.level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(invalid(
            "logging.level",
            format!(
                "unknown level '{}'; expected one of: {}",
                config.logging.level,
                LOG_LEVELS.join(", ")
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrustedKeyEntry;

    fn field_of(err: ConfigError) -> String {
        match err {
            ConfigError::ValidationError { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        validate(&RuntimeConfig::default()).unwrap();
    }

    #[test]
    fn test_manifest_file_must_be_bare_name() {
        let mut config = RuntimeConfig::default();
        config.discovery.manifest_file = "sub/extension.toml".into();
        assert_eq!(field_of(validate(&config).unwrap_err()), "discovery.manifest_file");
    }

    #[test]
    fn test_file_backend_needs_directory() {
        let mut config = RuntimeConfig::default();
        config.state.backend = StateBackendKind::File;
        assert_eq!(field_of(validate(&config).unwrap_err()), "state.directory");
        config.state.directory = Some("state".into());
        validate(&config).unwrap();
    }

    #[test]
    fn test_empty_trusted_key() {
        let mut config = RuntimeConfig::default();
        config.integrity.trusted_keys.push(TrustedKeyEntry {
            public_key: " ".into(),
            key_id: None,
        });
        assert_eq!(
            field_of(validate(&config).unwrap_err()),
            "integrity.trusted_keys[0].public_key"
        );
    }

    #[test]
    fn test_unknown_log_level() {
        let mut config = RuntimeConfig::default();
        config.logging.level = "loud".into();
        assert_eq!(field_of(validate(&config).unwrap_err()), "logging.level");
        config.logging.level = "WARN".into();
        validate(&config).unwrap();
    }
}
