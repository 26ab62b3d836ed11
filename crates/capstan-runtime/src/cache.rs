//! Discovery cache.
//!
//! Remembers the outcome of parsing and verifying each extension directory so
//! an unchanged directory is never re-parsed or re-verified. An entry stays
//! valid only while the modification times of the manifest file and of the
//! extension directory match what was recorded; the first lookup that sees a
//! difference drops the entry.
//!
//! The cache can live purely in memory or be persisted as a JSON file. The
//! file records the cache format and manifest schema it was written with; a
//! file from a different build is discarded wholesale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use capstan_storage::fs::{LockMode, acquire_lock_file, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::integrity::VerificationResult;
use crate::manifest::{MANIFEST_SCHEMA_VERSION, Manifest};

/// Version of the cache file layout.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// A file modification time with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileStamp {
    /// Seconds since the Unix epoch.
    pub secs: u64,
    /// Sub-second nanoseconds.
    pub nanos: u32,
}

impl FileStamp {
    /// Stamp of `time`. Times before the epoch collapse to zero.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }

    /// Current modification time of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be stat'ed or the platform has no
    /// modification times.
    pub fn of(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_system_time(std::fs::metadata(path)?.modified()?))
    }
}

/// Stored outcome for one extension directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Extension directory.
    pub location: PathBuf,
    /// Manifest file inside `location`.
    pub manifest_path: PathBuf,
    /// Manifest modification time when scanned.
    pub manifest_mtime: FileStamp,
    /// Directory modification time when scanned.
    pub dir_mtime: FileStamp,
    /// The validated manifest.
    pub manifest: Manifest,
    /// Verification outcome.
    pub verification: VerificationResult,
    /// When verification ran.
    pub verified_at: DateTime<Utc>,
    /// When a scan last saw this entry.
    pub last_scanned_at: DateTime<Utc>,
}

/// Why a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// Nothing stored for the location.
    Absent,
    /// A timestamp changed; the entry was removed.
    Stale,
    /// The manifest or directory could not be stat'ed; the entry was removed.
    Unreadable,
}

/// Result of [`DiscoveryCache::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// A still-valid entry.
    Hit(Box<CacheEntry>),
    /// No usable entry.
    Miss(MissReason),
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    cache_version: u32,
    manifest_schema: u32,
    entries: Vec<CacheEntry>,
}

/// Scan results keyed by extension location.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    path: Option<PathBuf>,
    entries: BTreeMap<PathBuf, CacheEntry>,
    dirty: bool,
}

impl DiscoveryCache {
    /// A cache that is never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open the cache persisted at `path`.
    ///
    /// A missing file starts empty. An unreadable or corrupt file is logged
    /// and ignored, and a file written for another cache format or manifest
    /// schema is discarded; neither fails.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_entries(&path);
        // A discarded file should be rewritten on the next flush.
        let dirty = entries.is_none();
        Self {
            entries: entries
                .unwrap_or_default()
                .into_iter()
                .map(|e| (e.location.clone(), e))
                .collect(),
            path: Some(path),
            dirty,
        }
    }

    /// Backing file, if persisted.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up `location`, validating timestamps against the filesystem.
    ///
    /// A stale or unreadable entry is removed before reporting the miss. On a
    /// hit, `last_scanned_at` is refreshed.
    pub fn lookup(&mut self, location: &Path) -> CacheLookup {
        let Some(entry) = self.entries.get_mut(location) else {
            return CacheLookup::Miss(MissReason::Absent);
        };

        let reason = match (FileStamp::of(&entry.manifest_path), FileStamp::of(location)) {
            (Ok(m), Ok(d)) if m == entry.manifest_mtime && d == entry.dir_mtime => {
                entry.last_scanned_at = Utc::now();
                self.dirty = true;
                return CacheLookup::Hit(Box::new(entry.clone()));
            },
            (Ok(_), Ok(_)) => MissReason::Stale,
            _ => MissReason::Unreadable,
        };

        debug!(location = %location.display(), ?reason, "Dropping discovery cache entry");
        self.entries.remove(location);
        self.dirty = true;
        CacheLookup::Miss(reason)
    }

    /// Peek at an entry without validating it.
    #[must_use]
    pub fn get(&self, location: &Path) -> Option<&CacheEntry> {
        self.entries.get(location)
    }

    /// Insert or replace the entry for `entry.location`.
    pub fn store(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.location.clone(), entry);
        self.dirty = true;
    }

    /// Remove the entry for `location`. Returns `true` if one existed.
    pub fn invalidate(&mut self, location: &Path) -> bool {
        let removed = self.entries.remove(location).is_some();
        self.dirty |= removed;
        removed
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Locations with an entry, sorted.
    pub fn locations(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    /// Persist pending changes. A no-op for in-memory caches.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Cache`] if the file cannot be locked,
    /// serialized or written.
    pub fn flush(&mut self) -> RuntimeResult<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let cache_err = |message: String| RuntimeError::Cache {
            path: path.to_path_buf(),
            message,
        };

        let file = CacheFile {
            cache_version: CACHE_FORMAT_VERSION,
            manifest_schema: MANIFEST_SCHEMA_VERSION,
            entries: self.entries.values().cloned().collect(),
        };
        let body = serde_json::to_vec_pretty(&file)
            .map_err(|e| cache_err(format!("failed to serialize: {e}")))?;

        let _lock_guard =
            acquire_lock_file(path, LockMode::Exclusive).map_err(|e| cache_err(e.to_string()))?;
        write_atomic(path, &body).map_err(|e| cache_err(e.to_string()))?;

        debug!(path = %path.display(), entries = self.entries.len(), "Flushed discovery cache");
        self.dirty = false;
        Ok(())
    }
}

/// Read persisted entries. `None` means the file existed but was discarded.
fn load_entries(path: &Path) -> Option<Vec<CacheEntry>> {
    let _lock_guard = match acquire_lock_file(path, LockMode::Shared) {
        Ok(guard) => guard,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot lock discovery cache, starting empty");
            return None;
        },
    };

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Some(Vec::new()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read discovery cache, starting empty");
            return None;
        },
    };

    let file: CacheFile = match serde_json::from_slice(&bytes) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt discovery cache, starting empty");
            return None;
        },
    };

    if file.cache_version != CACHE_FORMAT_VERSION || file.manifest_schema != MANIFEST_SCHEMA_VERSION
    {
        warn!(
            path = %path.display(),
            cache_version = file.cache_version,
            manifest_schema = file.manifest_schema,
            expected_cache_version = CACHE_FORMAT_VERSION,
            expected_manifest_schema = MANIFEST_SCHEMA_VERSION,
            "Discovery cache written by a different build, clearing all entries"
        );
        return None;
    }

    debug!(path = %path.display(), entries = file.entries.len(), "Loaded discovery cache");
    Some(file.entries)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::integrity::VerificationStatus;

    fn extension_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("extension.toml"),
            "id = \"c\"\nname = \"C\"\nversion = \"1.0.0\"\nentry_point = \"x\"\n",
        )
        .unwrap();
        dir
    }

    fn entry_for(dir: &Path) -> CacheEntry {
        let manifest_path = dir.join("extension.toml");
        let manifest =
            Manifest::parse(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        let now = Utc::now();
        CacheEntry {
            location: dir.to_path_buf(),
            manifest_mtime: FileStamp::of(&manifest_path).unwrap(),
            dir_mtime: FileStamp::of(dir).unwrap(),
            manifest_path,
            manifest,
            verification: VerificationResult {
                status: VerificationStatus::Skipped,
                detail: "none".into(),
            },
            verified_at: now,
            last_scanned_at: now,
        }
    }

    fn touch(path: &Path) {
        let later = SystemTime::now().checked_add(Duration::from_secs(5)).unwrap();
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(later)
            .unwrap();
    }

    #[test]
    fn test_hit_then_stale_after_touch() {
        let dir = extension_dir();
        let mut cache = DiscoveryCache::in_memory();
        cache.store(entry_for(dir.path()));

        assert!(matches!(cache.lookup(dir.path()), CacheLookup::Hit(_)));

        touch(&dir.path().join("extension.toml"));
        assert_eq!(cache.lookup(dir.path()), CacheLookup::Miss(MissReason::Stale));
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(dir.path()), CacheLookup::Miss(MissReason::Absent));
    }

    #[test]
    fn test_missing_manifest_is_unreadable() {
        let dir = extension_dir();
        let mut cache = DiscoveryCache::in_memory();
        cache.store(entry_for(dir.path()));
        std::fs::remove_file(dir.path().join("extension.toml")).unwrap();
        assert_eq!(
            cache.lookup(dir.path()),
            CacheLookup::Miss(MissReason::Unreadable)
        );
    }

    #[test]
    fn test_invalidate_and_clear() {
        let a = extension_dir();
        let b = extension_dir();
        let mut cache = DiscoveryCache::in_memory();
        cache.store(entry_for(a.path()));
        cache.store(entry_for(b.path()));
        assert_eq!(cache.len(), 2);

        assert!(cache.invalidate(a.path()));
        assert!(!cache.invalidate(a.path()));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_persisted_roundtrip() {
        let ext = extension_dir();
        let state = tempfile::tempdir().unwrap();
        let path = state.path().join("cache").join("discovery.json");

        let mut cache = DiscoveryCache::open(&path);
        assert!(cache.is_empty());
        cache.store(entry_for(ext.path()));
        cache.flush().unwrap();

        let mut reopened = DiscoveryCache::open(&path);
        assert_eq!(reopened.len(), 1);
        assert!(matches!(reopened.lookup(ext.path()), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_schema_change_sweeps_everything() {
        let ext = extension_dir();
        let state = tempfile::tempdir().unwrap();
        let path = state.path().join("discovery.json");

        let mut cache = DiscoveryCache::open(&path);
        cache.store(entry_for(ext.path()));
        cache.flush().unwrap();

        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["manifest_schema"] = serde_json::json!(0);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        assert!(DiscoveryCache::open(&path).is_empty());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let state = tempfile::tempdir().unwrap();
        let path = state.path().join("discovery.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let mut cache = DiscoveryCache::open(&path);
        assert!(cache.is_empty());
        cache.flush().unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["cache_version"], serde_json::json!(CACHE_FORMAT_VERSION));
    }

    #[test]
    fn test_in_memory_flush_is_noop() {
        let mut cache = DiscoveryCache::in_memory();
        assert!(cache.path().is_none());
        cache.flush().unwrap();
    }
}
