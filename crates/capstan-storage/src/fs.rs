//! Atomic file writes and advisory locks.
//!
//! Shared by the file-backed state backend and any other durable file the
//! runtime keeps (such as the discovery cache).

use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Whether to acquire a shared (read) or exclusive (write) lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers.
    Shared,
    /// One writer.
    Exclusive,
}

/// Acquire an advisory lock on a `.lock` sibling of `path`.
///
/// Returns `Some(file)` holding the lock (dropped = released). In shared mode
/// a missing lock file means no writer has ever run, so `None` is returned and
/// nothing is created. Exclusive mode creates the lock file and its parents.
///
/// # Errors
///
/// Returns [`StorageError::Io`] if the lock file cannot be opened or locked.
pub fn acquire_lock_file(path: &Path, mode: LockMode) -> StorageResult<Option<std::fs::File>> {
    let lock_path = path.with_extension("lock");

    match mode {
        LockMode::Shared => match std::fs::OpenOptions::new().read(true).open(&lock_path) {
            Ok(lock_file) => {
                lock_file
                    .lock_shared()
                    .map_err(|e| StorageError::io(path, format!("shared lock failed: {e}")))?;
                Ok(Some(lock_file))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&lock_path, e)),
        },
        LockMode::Exclusive => {
            if let Some(parent) = lock_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }

            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .read(true)
                .open(&lock_path)
                .map_err(|e| StorageError::io(&lock_path, e))?;

            lock_file
                .lock_exclusive()
                .map_err(|e| StorageError::io(path, format!("exclusive lock failed: {e}")))?;

            Ok(Some(lock_file))
        },
    }
}

/// Replace `path` with `bytes` so readers observe either the old or the new
/// content, never a partial write.
///
/// Writes a temporary file in the same directory, syncs it, then renames it
/// over the target. Parent directories are created as needed.
///
/// # Errors
///
/// Returns [`StorageError::Io`] if any step fails; the target is untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| StorageError::io(path, format!("failed to create temp file: {e}")))?;

    tmp.write_all(bytes)
        .map_err(|e| StorageError::io(path, format!("failed to write temp file: {e}")))?;

    tmp.as_file()
        .sync_all()
        .map_err(|e| StorageError::io(path, format!("failed to sync temp file: {e}")))?;

    tmp.persist(path)
        .map_err(|e| StorageError::io(path, format!("failed to replace file: {e}")))?;

    debug!(path = %path.display(), bytes = bytes.len(), "Atomically wrote file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("blob.bin");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        // Only the target remains; the temp file was renamed away.
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_shared_lock_without_writer_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        assert!(acquire_lock_file(&path, LockMode::Shared).unwrap().is_none());
        assert!(!path.with_extension("lock").exists());
    }

    #[test]
    fn test_exclusive_lock_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("cache.json");
        let guard = acquire_lock_file(&path, LockMode::Exclusive).unwrap();
        assert!(guard.is_some());
        assert!(path.with_extension("lock").exists());
    }
}
