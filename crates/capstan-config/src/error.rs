//! Configuration error types.

use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A config file is not valid TOML or does not fit the schema.
    #[error("failed to parse config {path}: {source}")]
    ParseError {
        /// File path, or a `<...>` marker for synthesized documents.
        path: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A value is out of range or inconsistent.
    #[error("invalid config field {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// No home directory could be determined.
    #[error("could not determine the home directory")]
    NoHomeDir,
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
