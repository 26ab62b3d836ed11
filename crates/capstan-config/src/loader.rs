//! Config file discovery and layered loading.
//!
//! Implements the `RuntimeConfig::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `~/.capstan/config.toml` (user)
//! 3. Merge `{workspace}/.capstan/config.toml` (workspace)
//! 4. Apply `CAPSTAN_*` environment overrides
//! 5. Deserialize the merged tree
//! 6. Expand `~/` in paths
//! 7. Validate

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::deep_merge;
use crate::types::RuntimeConfig;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Directory holding config files under the home and workspace roots.
pub const CONFIG_DIR: &str = ".capstan";

/// Config file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.toml";

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Load the configuration with layered file precedence.
///
/// `workspace_root` enables the workspace layer; `home_override` replaces the
/// detected home directory (tests, sandboxed hosts).
///
/// # Errors
///
/// Returns a [`ConfigError`] if any file is malformed or the merged
/// configuration fails validation.
pub fn load(
    workspace_root: Option<&Path>,
    home_override: Option<&Path>,
) -> ConfigResult<RuntimeConfig> {
    let home_dir = match home_override {
        Some(h) => h.to_path_buf(),
        None => home_directory()?,
    };
    load_with_env(workspace_root, &home_dir, &collect_env_vars())
}

/// [`load`] with an explicit home directory and environment snapshot.
///
/// # Errors
///
/// Same as [`load`].
pub fn load_with_env(
    workspace_root: Option<&Path>,
    home_dir: &Path,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<RuntimeConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let user_path = home_dir.join(CONFIG_DIR).join(CONFIG_FILE);
    if let Some(overlay) = try_load_file(&user_path)? {
        deep_merge(&mut merged, &overlay);
        info!(path = %user_path.display(), "loaded user config");
    }

    if let Some(ws_root) = workspace_root {
        let ws_path = ws_root.join(CONFIG_DIR).join(CONFIG_FILE);
        if let Some(overlay) = try_load_file(&ws_path)? {
            deep_merge(&mut merged, &overlay);
            info!(path = %ws_path.display(), "loaded workspace config");
        }
    }

    let env_count = apply_env_overrides(&mut merged, env_vars);
    if env_count > 0 {
        debug!(count = env_count, "applied environment overrides");
    }

    let mut config: RuntimeConfig =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    expand_paths(&mut config, home_dir);
    validate::validate(&config)?;
    Ok(config)
}

/// Load a config from a single file (no layering, no environment).
///
/// Missing fields take their defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed or validated.
pub fn load_file(path: &Path) -> ConfigResult<RuntimeConfig> {
    let metadata = std::fs::metadata(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(oversized(path, metadata.len()));
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    let config: RuntimeConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    validate::validate(&config)?;
    Ok(config)
}

fn oversized(path: &Path, len: u64) -> ConfigError {
    ConfigError::ValidationError {
        field: path.display().to_string(),
        message: format!(
            "config file is {len} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit"
        ),
    }
}

/// Try to load a file, returning `None` if it doesn't exist.
///
/// Reads once and handles `NotFound` instead of checking existence first.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(oversized(path, content.len() as u64));
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

/// Replace a leading `~` component with `home_dir`.
fn expand_home(path: &Path, home_dir: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => home_dir.join(components.as_path()),
        _ => path.to_path_buf(),
    }
}

fn expand_paths(config: &mut RuntimeConfig, home_dir: &Path) {
    for root in &mut config.discovery.roots {
        *root = expand_home(root, home_dir);
    }
    if let Some(cache) = config.discovery.cache_path.as_mut() {
        *cache = expand_home(cache, home_dir);
    }
    if let Some(dir) = config.state.directory.as_mut() {
        *dir = expand_home(dir, home_dir);
    }
}

/// Determine the user's home directory.
fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}
