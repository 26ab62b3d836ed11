//! Discovery engine.
//!
//! Walks extension roots, reads each immediate subdirectory's manifest,
//! verifies the package and feeds the registry. Unchanged directories are
//! served from the [`DiscoveryCache`] without re-parsing or re-verifying.
//! Problems with one directory are collected and never abort the scan.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capstan_config::DEFAULT_MANIFEST_FILE;
use chrono::Utc;
use semver::Version;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheLookup, DiscoveryCache, FileStamp};
use crate::id::ExtensionId;
use crate::integrity::{IntegrityPolicy, IntegrityVerifier, VerificationStatus};
use crate::manifest::Manifest;
use crate::registry::{RegisterOutcome, RegisteredExtension, VersionRegistry, precedence_key};

/// A problem with one root or extension directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// A root directory could not be listed.
    #[error("cannot read extension root {}: {message}", root.display())]
    RootUnreadable {
        /// The root.
        root: PathBuf,
        /// Reason.
        message: String,
    },

    /// A subdirectory has no manifest file.
    #[error("no manifest in {}", location.display())]
    MissingManifest {
        /// The directory.
        location: PathBuf,
    },

    /// The manifest or directory could not be read.
    #[error("cannot read {}: {message}", location.display())]
    Unreadable {
        /// The directory.
        location: PathBuf,
        /// Reason.
        message: String,
    },

    /// The manifest failed validation.
    #[error("invalid manifest in {}: {}", location.display(), violations.join("; "))]
    SchemaViolation {
        /// The directory.
        location: PathBuf,
        /// Every violation, as `field: message`.
        violations: Vec<String>,
    },

    /// The declared checksum does not match.
    #[error("{id}@{version} in {}: checksum mismatch: {detail}", location.display())]
    ChecksumMismatch {
        /// The directory.
        location: PathBuf,
        /// Extension id.
        id: ExtensionId,
        /// Version.
        version: Version,
        /// Verifier explanation.
        detail: String,
    },

    /// The signature did not verify.
    #[error("{id}@{version} in {}: invalid signature: {detail}", location.display())]
    SignatureInvalid {
        /// The directory.
        location: PathBuf,
        /// Extension id.
        id: ExtensionId,
        /// Version.
        version: Version,
        /// Verifier explanation.
        detail: String,
    },

    /// The package makes no integrity claim and policy requires one.
    #[error("{id}@{version} in {} is not signed or checksummed", location.display())]
    Unverified {
        /// The directory.
        location: PathBuf,
        /// Extension id.
        id: ExtensionId,
        /// Version.
        version: Version,
    },

    /// The `(id, version)` was already found earlier in the scan.
    #[error(
        "{id}@{version} in {} duplicates {}",
        location.display(),
        first_location.display()
    )]
    DuplicateExtension {
        /// Extension id.
        id: ExtensionId,
        /// Version.
        version: Version,
        /// The ignored directory.
        location: PathBuf,
        /// The directory that was registered.
        first_location: PathBuf,
    },
}

impl DiscoveryError {
    /// Directory (or root) the problem concerns.
    #[must_use]
    pub fn location(&self) -> &Path {
        match self {
            Self::RootUnreadable { root, .. } => root,
            Self::MissingManifest { location }
            | Self::Unreadable { location, .. }
            | Self::SchemaViolation { location, .. }
            | Self::ChecksumMismatch { location, .. }
            | Self::SignatureInvalid { location, .. }
            | Self::Unverified { location, .. }
            | Self::DuplicateExtension { location, .. } => location,
        }
    }
}

/// What a scan found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryReport {
    /// Entries registered by this scan, in visit order.
    pub registered: Vec<RegisteredExtension>,
    /// Problems, in visit order.
    pub errors: Vec<DiscoveryError>,
}

impl DiscoveryReport {
    /// Whether the scan found no problems.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A scan's report plus the bookkeeping the caller acts on.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// The report returned to hosts.
    pub report: DiscoveryReport,
    /// Entries removed because their directory disappeared or changed identity.
    pub pruned: Vec<RegisteredExtension>,
    /// Directories served from the cache.
    pub cache_hits: usize,
}

/// One directory's manifest and verification outcome.
struct Inspected {
    entry: CacheEntry,
    cached: bool,
}

/// Scans extension roots into a registry.
#[derive(Clone)]
pub struct DiscoveryEngine {
    verifier: Arc<dyn IntegrityVerifier>,
    policy: IntegrityPolicy,
    manifest_file: String,
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("policy", &self.policy)
            .field("manifest_file", &self.manifest_file)
            .finish_non_exhaustive()
    }
}

impl DiscoveryEngine {
    /// Engine using `verifier`, the default policy and manifest file name.
    #[must_use]
    pub fn new(verifier: Arc<dyn IntegrityVerifier>) -> Self {
        Self {
            verifier,
            policy: IntegrityPolicy::default(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
        }
    }

    /// Set the integrity policy.
    #[must_use]
    pub fn with_policy(mut self, policy: IntegrityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Look for manifests named `manifest_file`.
    #[must_use]
    pub fn with_manifest_file(mut self, manifest_file: impl Into<String>) -> Self {
        self.manifest_file = manifest_file.into();
        self
    }

    /// Integrity policy in force.
    #[must_use]
    pub fn policy(&self) -> IntegrityPolicy {
        self.policy
    }

    /// Manifest file name.
    #[must_use]
    pub fn manifest_file(&self) -> &str {
        &self.manifest_file
    }

    /// Scan `roots` in order.
    ///
    /// Subdirectories are visited in name order; hidden ones are skipped. The
    /// first directory to yield a given `(id, version)` wins. Registry entries
    /// under a successfully listed root that this scan did not produce are
    /// pruned, as are cache entries for directories that no longer exist.
    pub fn scan(
        &self,
        roots: &[PathBuf],
        registry: &mut VersionRegistry,
        cache: &mut DiscoveryCache,
    ) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut seen: HashMap<(ExtensionId, Version), PathBuf> = HashMap::new();
        let mut listed_roots = Vec::new();
        let mut visited: BTreeSet<PathBuf> = BTreeSet::new();

        for root in roots {
            let dirs = match list_subdirectories(root) {
                Ok(dirs) => dirs,
                Err(e) => {
                    outcome.report.errors.push(e);
                    continue;
                },
            };
            listed_roots.push(root.clone());
            debug!(root = %root.display(), candidates = dirs.len(), "Scanning extension root");

            for dir in dirs {
                visited.insert(dir.clone());
                match self.inspect(&dir, cache) {
                    Ok(inspected) => {
                        if inspected.cached {
                            outcome.cache_hits = outcome.cache_hits.saturating_add(1);
                        }
                        self.admit(inspected.entry, registry, cache, &mut seen, &mut outcome);
                    },
                    Err(e) => outcome.report.errors.push(e),
                }
            }
        }

        prune(&listed_roots, &seen, &visited, registry, cache, &mut outcome);

        for error in &outcome.report.errors {
            warn!(location = %error.location().display(), error = %error, "Discovery problem");
        }
        info!(
            registered = outcome.report.registered.len(),
            errors = outcome.report.errors.len(),
            cache_hits = outcome.cache_hits,
            pruned = outcome.pruned.len(),
            "Discovery scan complete"
        );
        outcome
    }

    /// Parse and verify one directory, or reuse its cached outcome.
    fn inspect(&self, dir: &Path, cache: &mut DiscoveryCache) -> Result<Inspected, DiscoveryError> {
        let manifest_path = dir.join(&self.manifest_file);
        if !manifest_path.is_file() {
            cache.invalidate(dir);
            return Err(DiscoveryError::MissingManifest {
                location: dir.to_path_buf(),
            });
        }

        if let CacheLookup::Hit(entry) = cache.lookup(dir) {
            debug!(location = %dir.display(), "Discovery cache hit");
            return Ok(Inspected {
                entry: *entry,
                cached: true,
            });
        }

        let unreadable = |e: std::io::Error| DiscoveryError::Unreadable {
            location: dir.to_path_buf(),
            message: e.to_string(),
        };
        // Stamp before reading so a write racing the read is caught next scan.
        let manifest_mtime = FileStamp::of(&manifest_path).map_err(unreadable)?;
        let dir_mtime = FileStamp::of(dir).map_err(unreadable)?;
        let text = std::fs::read_to_string(&manifest_path).map_err(unreadable)?;

        let manifest = Manifest::parse(&text).map_err(|e| DiscoveryError::SchemaViolation {
            location: dir.to_path_buf(),
            violations: e.violations.iter().map(ToString::to_string).collect(),
        })?;

        let verification = self.verifier.verify(dir, &manifest);
        debug!(
            extension_id = %manifest.id,
            version = %manifest.version,
            status = %verification.status,
            location = %dir.display(),
            "Verified extension package"
        );

        let now = Utc::now();
        let entry = CacheEntry {
            location: dir.to_path_buf(),
            manifest_path,
            manifest_mtime,
            dir_mtime,
            manifest,
            verification,
            verified_at: now,
            last_scanned_at: now,
        };
        cache.store(entry.clone());
        Ok(Inspected {
            entry,
            cached: false,
        })
    }

    /// Apply policy and duplicate rules, then register.
    fn admit(
        &self,
        entry: CacheEntry,
        registry: &mut VersionRegistry,
        cache: &mut DiscoveryCache,
        seen: &mut HashMap<(ExtensionId, Version), PathBuf>,
        outcome: &mut ScanOutcome,
    ) {
        let status = entry.verification.status;
        let id = entry.manifest.id.clone();
        let version = entry.manifest.version.clone();

        if !self.policy.admits(status) {
            outcome.report.errors.push(rejection(&entry));
        }
        if !self.policy.registers(status) {
            return;
        }

        let key = (id.clone(), precedence_key(&version));
        if let Some(first) = seen.get(&key) {
            outcome.report.errors.push(DiscoveryError::DuplicateExtension {
                id,
                version,
                location: entry.location,
                first_location: first.clone(),
            });
            return;
        }
        seen.insert(key, entry.location.clone());

        let registered = RegisteredExtension {
            manifest: entry.manifest,
            source: entry.location,
            status,
            detail: entry.verification.detail,
            discovered_at: entry.verified_at,
        };
        if let RegisterOutcome::Replaced(old) = registry.register(registered.clone())
            && old.source != registered.source
        {
            cache.invalidate(&old.source);
        }
        outcome.report.registered.push(registered);
    }
}

fn prune(
    roots: &[PathBuf],
    seen: &HashMap<(ExtensionId, Version), PathBuf>,
    visited: &BTreeSet<PathBuf>,
    registry: &mut VersionRegistry,
    cache: &mut DiscoveryCache,
    outcome: &mut ScanOutcome,
) {
    let mut stale: BTreeMap<(ExtensionId, Version), PathBuf> = BTreeMap::new();
    for root in roots {
        for (id, version, source) in registry.under_root(root) {
            if !seen.contains_key(&(id.clone(), precedence_key(&version))) {
                stale.insert((id, version), source);
            }
        }
    }
    for ((id, version), source) in stale {
        if let Some(removed) = registry.unregister(&id, &version) {
            info!(
                extension_id = %id,
                %version,
                location = %source.display(),
                "Pruned extension no longer present"
            );
            outcome.pruned.push(removed);
        }
    }

    let gone: Vec<PathBuf> = cache
        .locations()
        .filter(|loc| roots.iter().any(|r| loc.starts_with(r)) && !visited.contains(*loc))
        .map(Path::to_path_buf)
        .collect();
    for location in gone {
        cache.invalidate(&location);
    }
}

fn rejection(entry: &CacheEntry) -> DiscoveryError {
    let location = entry.location.clone();
    let id = entry.manifest.id.clone();
    let version = entry.manifest.version.clone();
    let detail = entry.verification.detail.clone();
    match entry.verification.status {
        VerificationStatus::ChecksumMismatch => DiscoveryError::ChecksumMismatch {
            location,
            id,
            version,
            detail,
        },
        VerificationStatus::SignatureInvalid => DiscoveryError::SignatureInvalid {
            location,
            id,
            version,
            detail,
        },
        VerificationStatus::Verified | VerificationStatus::Skipped => {
            DiscoveryError::Unverified {
                location,
                id,
                version,
            }
        },
    }
}

/// Non-hidden subdirectories of `root`, sorted by name.
fn list_subdirectories(root: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let unreadable = |e: std::io::Error| DiscoveryError::RootUnreadable {
        root: root.to_path_buf(),
        message: e.to_string(),
    };
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::integrity::{PackageVerifier, VerificationResult};

    #[derive(Default)]
    struct Counting {
        inner: PackageVerifier,
        calls: AtomicUsize,
    }

    impl IntegrityVerifier for Counting {
        fn verify(&self, source: &Path, manifest: &Manifest) -> VerificationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.verify(source, manifest)
        }
    }

    fn write_extension(root: &Path, dir: &str, id: &str, version: &str) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(
            path.join(DEFAULT_MANIFEST_FILE),
            format!("id = \"{id}\"\nname = \"{id}\"\nversion = \"{version}\"\nentry_point = \"builtin:{id}\"\n"),
        )
        .unwrap();
    }

    fn engine() -> (Arc<Counting>, DiscoveryEngine) {
        let verifier = Arc::new(Counting::default());
        let engine = DiscoveryEngine::new(Arc::clone(&verifier) as Arc<dyn IntegrityVerifier>);
        (verifier, engine)
    }

    #[test]
    fn test_scan_collects_errors_without_aborting() {
        let root = tempfile::tempdir().unwrap();
        write_extension(root.path(), "good", "good", "1.0.0");
        std::fs::create_dir(root.path().join("empty")).unwrap();
        std::fs::create_dir(root.path().join(".hidden")).unwrap();
        let broken = root.path().join("broken");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(broken.join(DEFAULT_MANIFEST_FILE), "id = \"Bad Id\"\n").unwrap();

        let (_, engine) = engine();
        let mut registry = VersionRegistry::new();
        let mut cache = DiscoveryCache::in_memory();
        let outcome = engine.scan(
            &[root.path().to_path_buf(), root.path().join("missing")],
            &mut registry,
            &mut cache,
        );

        let report = outcome.report;
        assert_eq!(report.registered.len(), 1);
        assert_eq!(report.registered[0].status, VerificationStatus::Skipped);
        assert_eq!(report.errors.len(), 3);
        assert!(matches!(report.errors[0], DiscoveryError::SchemaViolation { .. }));
        assert!(matches!(report.errors[1], DiscoveryError::MissingManifest { .. }));
        assert!(matches!(report.errors[2], DiscoveryError::RootUnreadable { .. }));
        assert!(registry.get(&ExtensionId::new("good").unwrap(), &Version::new(1, 0, 0)).is_some());
    }

    #[test]
    fn test_rescan_uses_cache() {
        let root = tempfile::tempdir().unwrap();
        write_extension(root.path(), "a", "a", "1.0.0");
        write_extension(root.path(), "b", "b", "2.0.0");

        let (verifier, engine) = engine();
        let mut registry = VersionRegistry::new();
        let mut cache = DiscoveryCache::in_memory();
        let roots = [root.path().to_path_buf()];

        let first = engine.scan(&roots, &mut registry, &mut cache);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
        let second = engine.scan(&roots, &mut registry, &mut cache);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(first.report, second.report);
    }

    #[test]
    fn test_first_duplicate_wins() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        write_extension(one.path(), "x", "x", "1.0.0");
        write_extension(two.path(), "x-copy", "x", "1.0.0");

        let (_, engine) = engine();
        let mut registry = VersionRegistry::new();
        let mut cache = DiscoveryCache::in_memory();
        let report = engine
            .scan(
                &[one.path().to_path_buf(), two.path().to_path_buf()],
                &mut registry,
                &mut cache,
            )
            .report;

        assert_eq!(report.registered.len(), 1);
        assert_eq!(report.registered[0].source, one.path().join("x"));
        match &report.errors[..] {
            [DiscoveryError::DuplicateExtension { location, first_location, .. }] => {
                assert_eq!(location, &two.path().join("x-copy"));
                assert_eq!(first_location, &one.path().join("x"));
            },
            other => panic!("unexpected errors: {other:?}"),
        }
    }

    #[test]
    fn test_removed_directory_is_pruned() {
        let root = tempfile::tempdir().unwrap();
        write_extension(root.path(), "a", "a", "1.0.0");
        write_extension(root.path(), "b", "b", "1.0.0");

        let (_, engine) = engine();
        let mut registry = VersionRegistry::new();
        let mut cache = DiscoveryCache::in_memory();
        let roots = [root.path().to_path_buf()];
        engine.scan(&roots, &mut registry, &mut cache);
        assert_eq!(registry.len(), 2);

        std::fs::remove_dir_all(root.path().join("b")).unwrap();
        let outcome = engine.scan(&roots, &mut registry, &mut cache);
        assert_eq!(outcome.pruned.len(), 1);
        assert_eq!(outcome.pruned[0].id().as_str(), "b");
        assert_eq!(registry.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_require_verified_refuses_unsigned() {
        let root = tempfile::tempdir().unwrap();
        write_extension(root.path(), "a", "a", "1.0.0");

        let (_, engine) = engine();
        let engine = engine.with_policy(IntegrityPolicy {
            require_verified: true,
            register_rejected: false,
        });
        let mut registry = VersionRegistry::new();
        let mut cache = DiscoveryCache::in_memory();
        let report = engine
            .scan(&[root.path().to_path_buf()], &mut registry, &mut cache)
            .report;
        assert!(report.registered.is_empty());
        assert!(matches!(report.errors[0], DiscoveryError::Unverified { .. }));
        assert!(registry.is_empty());
    }
}
