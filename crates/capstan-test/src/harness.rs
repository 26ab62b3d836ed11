//! Test harness helpers.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capstan_telemetry::{LogConfig, setup_logging};
use tempfile::TempDir;

/// Create a temporary directory for testing.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created.
#[must_use]
pub fn test_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Set up test logging with the given filter.
///
/// Goes through [`capstan_telemetry::setup_logging`] with output captured by
/// the test harness. `RUST_LOG` wins when set. Safe to call from every test.
///
/// ```rust,ignore
/// use capstan_test::setup_test_logging;
///
/// #[test]
/// fn my_test() {
///     setup_test_logging("capstan_runtime=debug");
/// }
/// ```
pub fn setup_test_logging(filter: &str) {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| filter.to_string());
    let _ = setup_logging(&LogConfig::for_tests(level));
}

/// Set up test logging with default filter (warn level).
pub fn init_test_tracing() {
    setup_test_logging("warn");
}

/// Push the modification time of the file at `path` a few seconds forward.
///
/// Rewrites in quick succession can land on the same timestamp; tests that
/// need a change to be noticed call this after writing.
///
/// # Panics
///
/// Panics if the file cannot be opened or its times updated.
pub fn bump_mtime(path: &Path) {
    let file = File::options()
        .write(true)
        .open(path)
        .expect("Failed to open file for touching");
    let current = file
        .metadata()
        .and_then(|m| m.modified())
        .expect("Failed to read modification time");
    let later = current
        .checked_add(Duration::from_secs(5))
        .expect("modification time overflow");
    file.set_modified(later)
        .expect("Failed to set modification time");
}

/// A temporary extension root plus a second temporary directory for state
/// and cache files.
#[derive(Debug)]
pub struct TestRoots {
    /// Directory scanned for extensions.
    pub extensions: TempDir,
    /// Scratch directory for state and cache files.
    pub scratch: TempDir,
}

impl TestRoots {
    /// Create both directories.
    #[must_use]
    pub fn new() -> Self {
        Self {
            extensions: test_dir(),
            scratch: test_dir(),
        }
    }

    /// The extension root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.extensions.path()
    }

    /// The extension root as an owned path.
    #[must_use]
    pub fn root_buf(&self) -> PathBuf {
        self.extensions.path().to_path_buf()
    }

    /// Path of `name` inside the scratch directory.
    #[must_use]
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }
}

impl Default for TestRoots {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_setup_is_repeatable() {
        setup_test_logging("capstan_runtime=debug");
        init_test_tracing();
        setup_test_logging("[not a directive");
    }

    #[test]
    fn bump_moves_mtime_forward() {
        let dir = test_dir();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, "x").unwrap();
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        bump_mtime(&path);
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(after > before);
    }

    #[test]
    fn roots_are_distinct() {
        let roots = TestRoots::new();
        assert!(roots.root().exists());
        assert_ne!(roots.root_buf(), roots.scratch.path());
        assert!(roots.scratch_path("cache.json").starts_with(roots.scratch.path()));
    }
}
