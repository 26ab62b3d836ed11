//! Version registry and resolver.
//!
//! Holds every discovered version of every extension id. Multiple versions of
//! one id coexist; at most one entry exists per `(id, version)`. Versions are
//! keyed by precedence, so `1.0.0+a` and `1.0.0+b` share a slot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::{BuildMetadata, Version};
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};
use crate::id::ExtensionId;
use crate::integrity::VerificationStatus;
use crate::manifest::Manifest;
use crate::version::VersionSpecifier;

/// One registered `(id, version)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredExtension {
    /// Validated manifest.
    pub manifest: Manifest,
    /// Extension directory.
    pub source: PathBuf,
    /// Verification outcome.
    pub status: VerificationStatus,
    /// Verification explanation.
    pub detail: String,
    /// When the package was verified.
    pub discovered_at: DateTime<Utc>,
}

impl RegisteredExtension {
    /// Extension id.
    #[must_use]
    pub fn id(&self) -> &ExtensionId {
        &self.manifest.id
    }

    /// Version.
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    /// Whether the entry may be resolved and activated.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.status.is_trusted()
    }

    fn same_content(&self, other: &Self) -> bool {
        self.manifest == other.manifest
            && self.source == other.source
            && self.status == other.status
            && self.detail == other.detail
    }
}

/// What [`VersionRegistry::register`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    /// A new `(id, version)`.
    Inserted,
    /// An existing entry with different content was replaced; holds the old entry.
    Replaced(Box<RegisteredExtension>),
    /// An identical entry was already present.
    Unchanged,
}

/// `version` without build metadata, which does not affect precedence.
#[must_use]
pub fn precedence_key(version: &Version) -> Version {
    if version.build.is_empty() {
        return version.clone();
    }
    Version {
        build: BuildMetadata::EMPTY,
        ..version.clone()
    }
}

/// All known versions of all extensions.
#[derive(Debug, Default)]
pub struct VersionRegistry {
    entries: BTreeMap<ExtensionId, BTreeMap<Version, RegisteredExtension>>,
}

impl VersionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    ///
    /// An entry whose version differs only in build metadata is replaced.
    pub fn register(&mut self, entry: RegisteredExtension) -> RegisterOutcome {
        let versions = self.entries.entry(entry.id().clone()).or_default();
        let version = precedence_key(entry.version());

        match versions.get(&version) {
            Some(existing) if existing.same_content(&entry) => RegisterOutcome::Unchanged,
            Some(_) => {
                info!(
                    extension_id = %entry.id(),
                    version = %entry.version(),
                    location = %entry.source.display(),
                    "Replacing registered extension"
                );
                versions
                    .insert(version, entry)
                    .map_or(RegisterOutcome::Inserted, |old| {
                        RegisterOutcome::Replaced(Box::new(old))
                    })
            },
            None => {
                debug!(
                    extension_id = %entry.id(),
                    version = %entry.version(),
                    status = %entry.status,
                    "Registered extension"
                );
                versions.insert(version, entry);
                RegisterOutcome::Inserted
            },
        }
    }

    /// Remove one entry.
    pub fn unregister(&mut self, id: &ExtensionId, version: &Version) -> Option<RegisteredExtension> {
        let versions = self.entries.get_mut(id)?;
        let removed = versions.remove(&precedence_key(version));
        if versions.is_empty() {
            self.entries.remove(id);
        }
        removed
    }

    /// Look up one entry.
    #[must_use]
    pub fn get(&self, id: &ExtensionId, version: &Version) -> Option<&RegisteredExtension> {
        self.entries.get(id)?.get(&precedence_key(version))
    }

    /// Whether any version of `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &ExtensionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Every registered version of `id`, ascending. Includes untrusted entries.
    #[must_use]
    pub fn versions(&self, id: &ExtensionId) -> Vec<Version> {
        self.entries
            .get(id)
            .map(|v| v.values().map(|e| e.version().clone()).collect())
            .unwrap_or_default()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &ExtensionId> {
        self.entries.keys()
    }

    /// Every entry, ordered by id then version.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredExtension> {
        self.entries.values().flat_map(BTreeMap::values)
    }

    /// Entries whose source lies under `root`.
    #[must_use]
    pub fn under_root(&self, root: &Path) -> Vec<(ExtensionId, Version, PathBuf)> {
        self.iter()
            .filter(|e| e.source.starts_with(root))
            .map(|e| (e.id().clone(), e.version().clone(), e.source.clone()))
            .collect()
    }

    /// Number of `(id, version)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Choose the version of `id` to use.
    ///
    /// Only trusted entries are candidates. Without a specifier the highest
    /// stable version wins, falling back to the highest pre-release when no
    /// stable version exists. With a specifier, candidates are filtered by it;
    /// pre-releases compete with stable versions when the specifier names a
    /// pre-release, and are otherwise used only when no stable version
    /// satisfies.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoMatchingVersion`] listing every registered
    /// version of `id` when nothing qualifies.
    pub fn resolve(
        &self,
        id: &ExtensionId,
        specifier: Option<&VersionSpecifier>,
    ) -> RuntimeResult<Version> {
        let candidates: Vec<&Version> = self
            .entries
            .get(id)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|e| e.is_trusted())
            .map(RegisteredExtension::version)
            .filter(|v| specifier.is_none_or(|s| s.matches(v)))
            .collect();

        let highest_stable = candidates.iter().rev().find(|v| v.pre.is_empty());
        let highest_any = candidates.last();
        let prerelease_welcome = specifier.is_some_and(VersionSpecifier::names_prerelease);

        let chosen = if prerelease_welcome {
            highest_any
        } else {
            highest_stable.or(highest_any)
        };

        chosen.map(|v| (*v).clone()).ok_or_else(|| RuntimeError::NoMatchingVersion {
            id: id.clone(),
            specifier: specifier.map_or_else(|| "*".to_string(), ToString::to_string),
            available: self.versions(id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, version: &str, status: VerificationStatus) -> RegisteredExtension {
        let manifest = Manifest::parse(&format!(
            "id = \"{id}\"\nname = \"{id}\"\nversion = \"{version}\"\nentry_point = \"builtin:{id}\"\n"
        ))
        .unwrap();
        RegisteredExtension {
            source: PathBuf::from(format!("/ext/{id}-{version}")),
            manifest,
            status,
            detail: String::new(),
            discovered_at: Utc::now(),
        }
    }

    fn registry(versions: &[&str]) -> VersionRegistry {
        let mut r = VersionRegistry::new();
        for v in versions {
            r.register(entry("x", v, VerificationStatus::Verified));
        }
        r
    }

    fn id(s: &str) -> ExtensionId {
        ExtensionId::new(s).unwrap()
    }

    fn spec(s: &str) -> VersionSpecifier {
        VersionSpecifier::parse(s).unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_resolve_prefers_stable() {
        let r = registry(&["1.0.0", "1.2.0", "2.0.0-beta"]);
        assert_eq!(r.resolve(&id("x"), None).unwrap(), v("1.2.0"));
        assert_eq!(r.resolve(&id("x"), Some(&spec(">=2.0.0"))).unwrap(), v("2.0.0-beta"));
        assert_eq!(r.resolve(&id("x"), Some(&spec("^1"))).unwrap(), v("1.2.0"));
    }

    #[test]
    fn test_specifier_naming_prerelease() {
        let r = registry(&["1.0.0", "1.1.0-rc.1"]);
        assert_eq!(r.resolve(&id("x"), Some(&spec(">=1.0.0"))).unwrap(), v("1.0.0"));
        assert_eq!(
            r.resolve(&id("x"), Some(&spec(">=1.0.0-alpha"))).unwrap(),
            v("1.1.0-rc.1")
        );
    }

    #[test]
    fn test_only_prereleases_without_specifier() {
        let r = registry(&["0.9.0-alpha", "0.9.0-beta"]);
        assert_eq!(r.resolve(&id("x"), None).unwrap(), v("0.9.0-beta"));
    }

    #[test]
    fn test_no_match_lists_all_versions() {
        let r = registry(&["2.0.0-beta", "1.0.0", "1.2.0"]);
        match r.resolve(&id("x"), Some(&spec("==9.9.9"))) {
            Err(RuntimeError::NoMatchingVersion {
                specifier,
                available,
                ..
            }) => {
                assert_eq!(specifier, "==9.9.9");
                assert_eq!(available, vec![v("1.0.0"), v("1.2.0"), v("2.0.0-beta")]);
            },
            other => panic!("expected NoMatchingVersion, got {other:?}"),
        }
        assert!(matches!(
            r.resolve(&id("nope"), None),
            Err(RuntimeError::NoMatchingVersion { available, .. }) if available.is_empty()
        ));
    }

    #[test]
    fn test_untrusted_never_resolved() {
        let mut r = registry(&["1.0.0"]);
        r.register(entry("x", "2.0.0", VerificationStatus::ChecksumMismatch));
        r.register(entry("x", "1.5.0", VerificationStatus::Skipped));
        assert_eq!(r.resolve(&id("x"), None).unwrap(), v("1.5.0"));
        assert!(r.resolve(&id("x"), Some(&spec(">=2"))).is_err());
        assert_eq!(r.versions(&id("x")).len(), 3);
    }

    #[test]
    fn test_build_metadata_shares_a_slot() {
        let mut r = VersionRegistry::new();
        let a = entry("x", "1.0.0+a", VerificationStatus::Verified);
        assert_eq!(r.register(a.clone()), RegisterOutcome::Inserted);
        assert_eq!(
            r.register(entry("x", "1.0.0+b", VerificationStatus::Verified)),
            RegisterOutcome::Replaced(Box::new(a))
        );

        assert_eq!(r.versions(&id("x")), vec![v("1.0.0+b")]);
        assert_eq!(r.get(&id("x"), &v("1.0.0")).unwrap().version(), &v("1.0.0+b"));
        assert_eq!(r.resolve(&id("x"), None).unwrap(), v("1.0.0+b"));
        assert!(r.unregister(&id("x"), &v("1.0.0+a")).is_some());
        assert!(r.is_empty());
    }

    #[test]
    fn test_register_outcomes() {
        let mut r = VersionRegistry::new();
        let first = entry("x", "1.0.0", VerificationStatus::Verified);
        assert_eq!(r.register(first.clone()), RegisterOutcome::Inserted);

        let mut again = first.clone();
        again.discovered_at = Utc::now();
        assert_eq!(r.register(again), RegisterOutcome::Unchanged);

        let mut moved = first.clone();
        moved.source = PathBuf::from("/elsewhere");
        match r.register(moved) {
            RegisterOutcome::Replaced(old) => assert_eq!(old.source, first.source),
            other => panic!("expected Replaced, got {other:?}"),
        }
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_unregister_drops_empty_id() {
        let mut r = registry(&["1.0.0"]);
        assert!(r.unregister(&id("x"), &v("1.0.0")).is_some());
        assert!(!r.contains(&id("x")));
        assert!(r.is_empty());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let a = registry(&["1.0.0", "1.2.0", "1.1.0"]);
        let b = registry(&["1.1.0", "1.0.0", "1.2.0"]);
        let s = spec(">=1.0, <1.2");
        assert_eq!(a.resolve(&id("x"), Some(&s)).unwrap(), b.resolve(&id("x"), Some(&s)).unwrap());
    }
}
