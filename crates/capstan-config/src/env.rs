//! Environment variable overrides.
//!
//! Applied after every file layer:
//! - `CAPSTAN_EXTENSION_PATH`: extra roots, platform path-list syntax, appended
//! - `CAPSTAN_LOG_LEVEL`: replaces `logging.level`

use std::collections::HashMap;

use tracing::debug;

/// Extra extension roots.
pub const ENV_EXTENSION_PATH: &str = "CAPSTAN_EXTENSION_PATH";
/// Log level override.
pub const ENV_LOG_LEVEL: &str = "CAPSTAN_LOG_LEVEL";

/// Snapshot the `CAPSTAN_*` variables of the current process.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with("CAPSTAN_"))
        .collect()
}

/// Apply overrides from `env` to the merged tree. Returns how many applied.
pub fn apply_env_overrides(merged: &mut toml::Value, env: &HashMap<String, String>) -> usize {
    let Some(root) = merged.as_table_mut() else {
        return 0;
    };
    let mut applied = 0usize;

    if let Some(paths) = env.get(ENV_EXTENSION_PATH).filter(|v| !v.trim().is_empty()) {
        let discovery = root
            .entry("discovery")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let Some(discovery) = discovery.as_table_mut() {
            let roots = discovery
                .entry("roots")
                .or_insert_with(|| toml::Value::Array(Vec::new()));
            if let Some(roots) = roots.as_array_mut() {
                for path in std::env::split_paths(paths) {
                    debug!(root = %path.display(), "adding extension root from environment");
                    roots.push(toml::Value::String(path.to_string_lossy().into_owned()));
                }
                applied = applied.saturating_add(1);
            }
        }
    }

    if let Some(level) = env.get(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
        let logging = root
            .entry("logging")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        if let Some(logging) = logging.as_table_mut() {
            logging.insert("level".to_string(), toml::Value::String(level.trim().to_string()));
            applied = applied.saturating_add(1);
        }
    }

    applied
}
