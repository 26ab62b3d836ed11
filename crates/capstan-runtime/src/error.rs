//! Runtime error types.

use std::path::PathBuf;

use capstan_config::ConfigError;
use capstan_storage::StorageError;
use semver::Version;
use thiserror::Error;

use crate::id::ExtensionId;
use crate::manifest::ValidationError;
use crate::version::SpecifierError;

/// Errors returned synchronously by runtime operations.
///
/// Discovery problems are not errors at this level; they are collected as
/// [`DiscoveryError`](crate::discovery::DiscoveryError) values in the scan
/// report.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A manifest document failed validation.
    #[error(transparent)]
    SchemaViolation(#[from] ValidationError),

    /// A version specifier failed to parse.
    #[error(transparent)]
    InvalidSpecifier(#[from] SpecifierError),

    /// A malformed extension id.
    #[error("invalid extension id: {0}")]
    InvalidId(String),

    /// No version of the id is registered.
    #[error("no version of extension {0} is registered")]
    UnknownExtension(ExtensionId),

    /// No registry entry for the requested `(id, version)`.
    #[error("extension {id}@{version} is not registered")]
    NotRegistered {
        /// Extension id.
        id: ExtensionId,
        /// Requested version.
        version: Version,
    },

    /// Resolution found nothing acceptable.
    #[error("no version of {id} matches '{specifier}' (available: {})", join_versions(available))]
    NoMatchingVersion {
        /// Extension id.
        id: ExtensionId,
        /// Specifier text, `*` when none was given.
        specifier: String,
        /// Every registered version of `id`, ascending.
        available: Vec<Version>,
    },

    /// A declared dependency could not be resolved.
    #[error("{extension} depends on {dependency_id} '{specifier}', which cannot be satisfied")]
    UnsatisfiedDependency {
        /// The extension being activated.
        extension: ExtensionId,
        /// The dependency that failed.
        dependency_id: ExtensionId,
        /// The dependency's specifier.
        specifier: String,
    },

    /// The resolved dependency graph contains a cycle.
    #[error("cyclic dependency: {}", join_ids(cycle))]
    CyclicDependency {
        /// The cycle, starting and ending at the same id.
        cycle: Vec<ExtensionId>,
    },

    /// The entry failed verification and cannot be activated.
    #[error("extension {id}@{version} failed verification and cannot be activated")]
    Untrusted {
        /// Extension id.
        id: ExtensionId,
        /// Version.
        version: Version,
    },

    /// The id is disabled.
    #[error("extension {0} is disabled")]
    Disabled(ExtensionId),

    /// No version of the id is active.
    #[error("extension {0} is not active")]
    NotActive(ExtensionId),

    /// The manifest declares no such action.
    #[error("extension {id}@{version} has no action '{action}'")]
    ActionNotFound {
        /// Extension id.
        id: ExtensionId,
        /// Active version.
        version: Version,
        /// Requested action.
        action: String,
    },

    /// Arguments did not match the declared parameters.
    #[error("invalid arguments for {id}.{action}: {}", problems.join("; "))]
    InvalidArguments {
        /// Extension id.
        id: ExtensionId,
        /// Action name.
        action: String,
        /// Every problem found.
        problems: Vec<String>,
    },

    /// The loader could not produce a usable instance.
    #[error("failed to load {id}@{version}: {message}")]
    LoadFailed {
        /// Extension id.
        id: ExtensionId,
        /// Version.
        version: Version,
        /// Reason.
        message: String,
    },

    /// A handler returned an error.
    #[error("{id}@{version} action '{action}' failed: {source}")]
    HandlerFailed {
        /// Extension id.
        id: ExtensionId,
        /// Version.
        version: Version,
        /// Action name.
        action: String,
        /// The handler's error.
        #[source]
        source: anyhow::Error,
    },

    /// State persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The discovery cache file could not be written.
    #[error("discovery cache {}: {message}", path.display())]
    Cache {
        /// Cache file path.
        path: PathBuf,
        /// Reason.
        message: String,
    },

    /// Configuration could not be turned into runtime settings.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn join_versions(versions: &[Version]) -> String {
    if versions.is_empty() {
        return "none".to_string();
    }
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_ids(ids: &[ExtensionId]) -> String {
    ids.iter()
        .map(ExtensionId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
