#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
//! Configuration for the Capstan extension runtime.
//!
//! # Usage
//!
//! ```rust,no_run
//! use capstan_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::load(Some(std::path::Path::new("."))).unwrap();
//! for root in &config.discovery.roots {
//!     println!("scanning {}", root.display());
//! }
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment variables** (`CAPSTAN_EXTENSION_PATH`, `CAPSTAN_LOG_LEVEL`)
//! 2. **Workspace** (`{workspace}/.capstan/config.toml`)
//! 3. **User** (`~/.capstan/config.toml`)
//! 4. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! This crate has no dependencies on other capstan crates. Conversion into
//! runtime types happens where the runtime is built.

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layered configuration merging.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use types::*;

impl RuntimeConfig {
    /// Load configuration with the full precedence chain.
    ///
    /// See [`loader::load`] for the algorithm.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(workspace_root: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(workspace_root, None)
    }

    /// Load configuration with an explicit home directory.
    ///
    /// # Errors
    ///
    /// Same as [`RuntimeConfig::load`].
    pub fn load_with_home(
        workspace_root: Option<&std::path::Path>,
        home_dir: &std::path::Path,
    ) -> ConfigResult<Self> {
        loader::load(workspace_root, Some(home_dir))
    }

    /// Load a single file without layering.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
