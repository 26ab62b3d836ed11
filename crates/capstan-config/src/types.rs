//! Configuration struct definitions.
//!
//! Every section implements `Default` and is `#[serde(default)]`, so a config
//! file only needs the fields it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default manifest file name inside each extension directory.
pub const DEFAULT_MANIFEST_FILE: &str = "extension.toml";

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Where and how extensions are discovered.
    pub discovery: DiscoverySection,
    /// Integrity policy and trusted signers.
    pub integrity: IntegritySection,
    /// Extension state persistence.
    pub state: StateSection,
    /// Logging.
    pub logging: LoggingSection,
}

/// `[discovery]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Extension root directories, scanned in order.
    pub roots: Vec<PathBuf>,
    /// Manifest file name looked up in each extension directory.
    pub manifest_file: String,
    /// Persisted discovery cache. `None` keeps the cache in memory only.
    pub cache_path: Option<PathBuf>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            cache_path: None,
        }
    }
}

/// `[integrity]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegritySection {
    /// Refuse extensions that declare neither checksum nor signature.
    pub require_verified: bool,
    /// Register extensions that fail verification (never resolvable).
    pub register_rejected: bool,
    /// Signers whose signatures are accepted.
    pub trusted_keys: Vec<TrustedKeyEntry>,
}

/// One `[[integrity.trusted_keys]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedKeyEntry {
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// Expected key id; checked against the key when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Which state backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    /// Process memory; lost on exit.
    #[default]
    Memory,
    /// One file per namespace under `state.directory`.
    File,
}

/// `[state]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// Backend kind.
    pub backend: StateBackendKind,
    /// Directory for the file backend.
    pub directory: Option<PathBuf>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    /// Multi-line human format.
    #[default]
    Pretty,
    /// Single-line human format.
    Compact,
    /// JSON lines.
    Json,
    /// Default subscriber format.
    Full,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level.
    pub level: String,
    /// Output format.
    pub format: LoggingFormat,
    /// Extra filter directives.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LoggingFormat::default(),
            directives: Vec::new(),
        }
    }
}
