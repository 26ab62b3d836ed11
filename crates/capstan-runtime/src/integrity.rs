//! Package integrity verification.
//!
//! A package is the extension directory minus its manifest and hidden
//! entries. Its digest covers every file's relative path and content, so
//! renames, additions and edits all change it.
//!
//! Checksums compare the declared digest against a fresh one in constant
//! time. Signatures are Ed25519 over a fixed payload binding the extension
//! id and version to the BLAKE3 digests of the package and of the manifest
//! itself, made by a key in the trusted set. Packages containing symbolic
//! links cannot be digested and fail verification.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use capstan_config::DEFAULT_MANIFEST_FILE;
use capstan_crypto::{
    ContentDigest, CryptoError, DigestAlgorithm, DigestHasher, KeyPair, Signature, TrustedKeys,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::manifest::{Manifest, SignatureMethod, SignatureSpec};

/// Domain separator of the signed payload.
pub const SIGNATURE_CONTEXT: &str = "capstan-extension-signature:v1";

/// Outcome of verifying one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Every declared claim holds.
    Verified,
    /// The declared checksum does not match the package.
    ChecksumMismatch,
    /// The signature is missing a trusted key or does not verify.
    SignatureInvalid,
    /// The manifest makes no integrity claim.
    Skipped,
}

impl VerificationStatus {
    /// Whether the package may be resolved and activated.
    #[must_use]
    pub const fn is_trusted(self) -> bool {
        matches!(self, Self::Verified | Self::Skipped)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::SignatureInvalid => "signature_invalid",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Outcome.
    pub status: VerificationStatus,
    /// Explanation.
    pub detail: String,
}

impl VerificationResult {
    fn new(status: VerificationStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

/// Checks a package against its manifest's integrity claims.
///
/// Implementations must be deterministic and must not modify the package.
pub trait IntegrityVerifier: Send + Sync {
    /// Verify the package rooted at `source`.
    fn verify(&self, source: &Path, manifest: &Manifest) -> VerificationResult;
}

/// What the discovery engine does with each verification outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityPolicy {
    /// Refuse packages without any integrity claim.
    pub require_verified: bool,
    /// Register failing packages (never resolvable) so hosts can list them.
    pub register_rejected: bool,
}

impl IntegrityPolicy {
    /// Whether a package with `status` is accepted as usable.
    #[must_use]
    pub const fn admits(self, status: VerificationStatus) -> bool {
        match status {
            VerificationStatus::Verified => true,
            VerificationStatus::Skipped => !self.require_verified,
            VerificationStatus::ChecksumMismatch | VerificationStatus::SignatureInvalid => false,
        }
    }

    /// Whether a package with `status` enters the registry at all.
    #[must_use]
    pub const fn registers(self, status: VerificationStatus) -> bool {
        self.admits(status) || (self.register_rejected && !status.is_trusted())
    }
}

// ---------------------------------------------------------------------------
// Package digest
// ---------------------------------------------------------------------------

/// Digest a package directory.
///
/// Files are taken in byte order of their `/`-separated relative paths.
/// `manifest_file` at the package root and every hidden entry are excluded.
///
/// # Errors
///
/// Returns an error if the directory cannot be walked, a file cannot be read,
/// or a non-hidden entry is a symbolic link.
pub fn package_digest(
    dir: &Path,
    algorithm: DigestAlgorithm,
    manifest_file: &str,
) -> io::Result<ContentDigest> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry?;
        if entry.depth() == 1 && entry.file_name() == manifest_file {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if entry.depth() > 0 && entry.path_is_symlink() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("package contains symbolic link '{rel}'"),
            ));
        }
        if !entry.file_type().is_file() {
            continue;
        }
        files.push((rel, entry.into_path()));
    }
    files.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut hasher = DigestHasher::new(algorithm);
    for (rel, path) in &files {
        let content = std::fs::read(path)?;
        let len = u64::try_from(content.len()).unwrap_or(u64::MAX);
        hasher.update(rel.as_bytes());
        hasher.update(&[0]);
        hasher.update(&len.to_le_bytes());
        hasher.update(&content);
    }
    debug!(dir = %dir.display(), files = files.len(), %algorithm, "Computed package digest");
    Ok(hasher.finalize())
}

/// BLAKE3 digest of the manifest's canonical form without `[signature]`.
///
/// The canonical form is [`Manifest::to_document`] rendered as TOML, so
/// formatting, comments and key order in the file do not matter but every
/// validated field does.
#[must_use]
pub fn manifest_digest(manifest: &Manifest) -> ContentDigest {
    let mut doc = manifest.to_document();
    doc.remove("signature");
    ContentDigest::compute(DigestAlgorithm::Blake3, doc.to_string().as_bytes())
}

/// The bytes a package signature covers.
#[must_use]
pub fn signing_payload(manifest: &Manifest, package: &ContentDigest) -> Vec<u8> {
    format!(
        "{SIGNATURE_CONTEXT}\n{}\n{}\n{}\n{}",
        manifest.id,
        manifest.version,
        package.to_hex(),
        manifest_digest(manifest).to_hex()
    )
    .into_bytes()
}

/// Sign the package at `dir` together with `manifest`.
///
/// Produces the manifest `[signature]` section a [`PackageVerifier`] trusting
/// `key` will accept. Any `[signature]` already on `manifest` is ignored;
/// every other field is covered.
///
/// # Errors
///
/// Returns an error if the package cannot be read.
pub fn sign_package(
    key: &KeyPair,
    dir: &Path,
    manifest_file: &str,
    manifest: &Manifest,
) -> io::Result<SignatureSpec> {
    let digest = package_digest(dir, DigestAlgorithm::Blake3, manifest_file)?;
    let signature = key.sign(&signing_payload(manifest, &digest));
    Ok(SignatureSpec {
        method: SignatureMethod::Ed25519,
        key_id: key.key_id(),
        value: signature.to_base64(),
    })
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// The standard verifier: checksum first, then signature.
#[derive(Debug, Clone)]
pub struct PackageVerifier {
    trusted: TrustedKeys,
    manifest_file: String,
}

impl Default for PackageVerifier {
    fn default() -> Self {
        Self::new(TrustedKeys::new())
    }
}

impl PackageVerifier {
    /// Verifier accepting signatures from `trusted`.
    #[must_use]
    pub fn new(trusted: TrustedKeys) -> Self {
        Self {
            trusted,
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
        }
    }

    /// Exclude a differently named manifest from package digests.
    #[must_use]
    pub fn with_manifest_file(mut self, manifest_file: impl Into<String>) -> Self {
        self.manifest_file = manifest_file.into();
        self
    }

    /// Trusted signers.
    #[must_use]
    pub fn trusted_keys(&self) -> &TrustedKeys {
        &self.trusted
    }

    fn check_signature(
        &self,
        source: &Path,
        manifest: &Manifest,
        spec: &SignatureSpec,
        digest: Option<&ContentDigest>,
    ) -> Result<(), String> {
        if !self.trusted.contains(&spec.key_id) {
            return Err(format!("key {} is not trusted", spec.key_id));
        }
        let signature = Signature::from_base64(&spec.value)
            .map_err(|e| format!("signature cannot be decoded: {e}"))?;

        let computed;
        let digest = match digest {
            Some(d) if d.algorithm() == DigestAlgorithm::Blake3 => d,
            _ => {
                computed = package_digest(source, DigestAlgorithm::Blake3, &self.manifest_file)
                    .map_err(|e| format!("cannot read package: {e}"))?;
                &computed
            },
        };

        let payload = signing_payload(manifest, digest);
        self.trusted
            .verify(&spec.key_id, &payload, &signature)
            .map_err(|e| match e {
                CryptoError::SignatureVerificationFailed => {
                    format!(
                        "signature by {} does not match the package and manifest",
                        spec.key_id
                    )
                },
                other => other.to_string(),
            })
    }
}

impl IntegrityVerifier for PackageVerifier {
    fn verify(&self, source: &Path, manifest: &Manifest) -> VerificationResult {
        if !manifest.declares_integrity() {
            return VerificationResult::new(
                VerificationStatus::Skipped,
                "no checksum or signature declared",
            );
        }

        let mut details = Vec::new();
        let mut checked = None;

        if let Some(checksum) = &manifest.checksum {
            let expected = match checksum.expected() {
                Ok(d) => d,
                Err(e) => {
                    return VerificationResult::new(
                        VerificationStatus::ChecksumMismatch,
                        format!("declared digest is unusable: {e}"),
                    );
                },
            };
            let actual = match package_digest(source, checksum.algorithm, &self.manifest_file) {
                Ok(d) => d,
                Err(e) => {
                    return VerificationResult::new(
                        VerificationStatus::ChecksumMismatch,
                        format!("cannot read package: {e}"),
                    );
                },
            };
            if !actual.matches(&expected) {
                return VerificationResult::new(
                    VerificationStatus::ChecksumMismatch,
                    format!("expected {expected}, computed {actual}"),
                );
            }
            details.push(format!("{} checksum matches", checksum.algorithm));
            checked = Some(actual);
        }

        if let Some(spec) = &manifest.signature {
            if let Err(reason) = self.check_signature(source, manifest, spec, checked.as_ref()) {
                return VerificationResult::new(VerificationStatus::SignatureInvalid, reason);
            }
            details.push(format!("signed by {}", spec.key_id));
        }

        VerificationResult::new(VerificationStatus::Verified, details.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn manifest(extra: &str) -> Manifest {
        Manifest::parse(&format!(
            "id = \"pkg\"\nname = \"Pkg\"\nversion = \"1.0.0\"\nentry_point = \"builtin:pkg\"\n{extra}"
        ))
        .unwrap()
    }

    fn package() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.txt", "hello");
        write(dir.path(), "lib/util.txt", "util");
        write(dir.path(), "extension.toml", "ignored");
        write(dir.path(), ".git/HEAD", "ignored");
        dir
    }

    fn blake3_hex(dir: &Path) -> String {
        package_digest(dir, DigestAlgorithm::Blake3, DEFAULT_MANIFEST_FILE)
            .unwrap()
            .to_hex()
    }

    #[test]
    fn test_digest_ignores_manifest_and_hidden() {
        let dir = package();
        let before = blake3_hex(dir.path());

        write(dir.path(), "extension.toml", "changed");
        write(dir.path(), ".git/HEAD", "changed");
        assert_eq!(blake3_hex(dir.path()), before);

        write(dir.path(), "lib/util.txt", "changed");
        assert_ne!(blake3_hex(dir.path()), before);
    }

    #[test]
    fn test_digest_detects_rename() {
        let dir = package();
        let before = blake3_hex(dir.path());
        std::fs::rename(dir.path().join("main.txt"), dir.path().join("other.txt")).unwrap();
        assert_ne!(blake3_hex(dir.path()), before);
    }

    #[test]
    fn test_digest_is_path_ordered() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "1");
        write(dir.path(), "a/b.txt", "2");

        let mut hasher = DigestHasher::new(DigestAlgorithm::Sha256);
        for (rel, content) in [("a.txt", "1"), ("a/b.txt", "2")] {
            hasher.update(rel.as_bytes());
            hasher.update(&[0]);
            hasher.update(&1u64.to_le_bytes());
            hasher.update(content.as_bytes());
        }
        let computed = package_digest(dir.path(), DigestAlgorithm::Sha256, "extension.toml").unwrap();
        assert_eq!(computed, hasher.finalize());
    }

    #[test]
    fn test_skipped_without_claims() {
        let dir = package();
        let result = PackageVerifier::default().verify(dir.path(), &manifest(""));
        assert_eq!(result.status, VerificationStatus::Skipped);
    }

    #[test]
    fn test_checksum() {
        let dir = package();
        let good = manifest(&format!(
            "[checksum]\nalgorithm = \"blake3\"\ndigest = \"{}\"\n",
            blake3_hex(dir.path())
        ));
        let verifier = PackageVerifier::default();
        assert_eq!(
            verifier.verify(dir.path(), &good).status,
            VerificationStatus::Verified
        );

        write(dir.path(), "main.txt", "tampered");
        let result = verifier.verify(dir.path(), &good);
        assert_eq!(result.status, VerificationStatus::ChecksumMismatch);
        assert!(result.detail.starts_with("expected blake3:"));
    }

    #[test]
    fn test_signature() {
        let dir = package();
        let key = KeyPair::generate();
        let m = manifest("");
        let spec = sign_package(&key, dir.path(), DEFAULT_MANIFEST_FILE, &m).unwrap();
        let signed = Manifest {
            signature: Some(spec),
            ..m
        };

        let trusted: TrustedKeys = [key.public_key()].into_iter().collect();
        let verifier = PackageVerifier::new(trusted);
        let result = verifier.verify(dir.path(), &signed);
        assert_eq!(result.status, VerificationStatus::Verified, "{}", result.detail);

        let untrusting = PackageVerifier::default();
        let result = untrusting.verify(dir.path(), &signed);
        assert_eq!(result.status, VerificationStatus::SignatureInvalid);
        assert!(result.detail.contains("not trusted"));

        write(dir.path(), "main.txt", "tampered");
        assert_eq!(
            verifier.verify(dir.path(), &signed).status,
            VerificationStatus::SignatureInvalid
        );
    }

    #[test]
    fn test_signature_binds_version() {
        let dir = package();
        let key = KeyPair::generate();
        let m = manifest("");
        let spec = sign_package(&key, dir.path(), DEFAULT_MANIFEST_FILE, &m).unwrap();
        let bumped = Manifest {
            version: Version::new(1, 0, 1),
            signature: Some(spec),
            ..m
        };
        let verifier = PackageVerifier::new([key.public_key()].into_iter().collect());
        assert_eq!(
            verifier.verify(dir.path(), &bumped).status,
            VerificationStatus::SignatureInvalid
        );
    }

    #[test]
    fn test_signature_binds_manifest() {
        let dir = package();
        let key = KeyPair::generate();
        let m = manifest("default_enabled = false\n");
        let spec = sign_package(&key, dir.path(), DEFAULT_MANIFEST_FILE, &m).unwrap();
        let verifier = PackageVerifier::new([key.public_key()].into_iter().collect());

        let signed = Manifest {
            signature: Some(spec.clone()),
            ..m.clone()
        };
        assert_eq!(
            verifier.verify(dir.path(), &signed).status,
            VerificationStatus::Verified
        );

        let redirected = Manifest {
            entry_point: "builtin:elsewhere".into(),
            signature: Some(spec.clone()),
            ..m.clone()
        };
        let result = verifier.verify(dir.path(), &redirected);
        assert_eq!(result.status, VerificationStatus::SignatureInvalid);
        assert!(result.detail.contains("manifest"), "{}", result.detail);

        let enabled = Manifest {
            default_enabled: true,
            signature: Some(spec),
            ..m
        };
        assert_eq!(
            verifier.verify(dir.path(), &enabled).status,
            VerificationStatus::SignatureInvalid
        );
    }

    #[test]
    fn test_manifest_digest_ignores_signature_and_layout() {
        let plain = manifest("tags = [\"a\"]\n");
        let reordered = Manifest::parse(
            "# comment\ntags = [\"a\"]\nentry_point = \"builtin:pkg\"\nversion = \"1.0.0\"\nname = \"Pkg\"\nid = \"pkg\"\n",
        )
        .unwrap();
        assert_eq!(manifest_digest(&plain), manifest_digest(&reordered));

        let key = KeyPair::generate();
        let signed = Manifest {
            signature: Some(sign_package(&key, package().path(), DEFAULT_MANIFEST_FILE, &plain).unwrap()),
            ..plain.clone()
        };
        assert_eq!(manifest_digest(&plain), manifest_digest(&signed));
    }

    #[cfg(unix)]
    #[test]
    fn test_digest_refuses_symlinks() {
        let dir = package();
        std::os::unix::fs::symlink("/etc/hostname", dir.path().join("lib/link")).unwrap();

        let err = package_digest(dir.path(), DigestAlgorithm::Blake3, DEFAULT_MANIFEST_FILE)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("'lib/link'"), "{err}");

        // Hidden entries are never walked, links included.
        std::fs::remove_file(dir.path().join("lib/link")).unwrap();
        std::os::unix::fs::symlink("/etc/hostname", dir.path().join(".cache")).unwrap();
        assert!(package_digest(dir.path(), DigestAlgorithm::Blake3, DEFAULT_MANIFEST_FILE).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_fails_checksum() {
        let dir = package();
        let m = manifest(&format!(
            "[checksum]\nalgorithm = \"blake3\"\ndigest = \"{}\"\n",
            blake3_hex(dir.path())
        ));
        std::os::unix::fs::symlink(dir.path().join("main.txt"), dir.path().join("alias.txt"))
            .unwrap();

        let result = PackageVerifier::default().verify(dir.path(), &m);
        assert_eq!(result.status, VerificationStatus::ChecksumMismatch);
        assert!(result.detail.contains("symbolic link 'alias.txt'"), "{}", result.detail);
    }

    #[test]
    fn test_checksum_checked_before_signature() {
        let dir = package();
        let m = manifest(&format!(
            "[checksum]\nalgorithm = \"sha256\"\ndigest = \"{}\"\n[signature]\nmethod = \"ed25519\"\nkey_id = \"0000000000000000\"\nvalue = \"AAAA\"\n",
            "00".repeat(32)
        ));
        let result = PackageVerifier::default().verify(dir.path(), &m);
        assert_eq!(result.status, VerificationStatus::ChecksumMismatch);
    }

    #[test]
    fn test_policy() {
        let lenient = IntegrityPolicy::default();
        assert!(lenient.admits(VerificationStatus::Skipped));
        assert!(!lenient.registers(VerificationStatus::ChecksumMismatch));

        let strict = IntegrityPolicy {
            require_verified: true,
            register_rejected: true,
        };
        assert!(!strict.admits(VerificationStatus::Skipped));
        assert!(!strict.registers(VerificationStatus::Skipped));
        assert!(strict.registers(VerificationStatus::SignatureInvalid));
        assert!(!strict.admits(VerificationStatus::SignatureInvalid));
    }
}
