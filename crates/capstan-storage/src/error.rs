//! Storage error types.

use std::path::PathBuf;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A storage operation failed.
    #[error("storage error: {0}")]
    Internal(String),

    /// A filesystem operation failed.
    #[error("I/O error at {path}: {message}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The namespace is invalid.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, message: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
