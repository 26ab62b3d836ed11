//! On-disk extension fixtures.

use std::path::{Path, PathBuf};

use capstan_crypto::{DigestAlgorithm, KeyPair};
use capstan_runtime::ExtensionId;
use capstan_runtime::integrity::{package_digest, sign_package};
use semver::Version;
use toml::{Table, Value};

const DEFAULT_MANIFEST_FILE: &str = "extension.toml";

/// Builder writing an extension directory: payload files plus a manifest.
///
/// ```rust,ignore
/// let dir = ExtensionFixture::new("word-count", "1.0.0")
///     .action_toml(r#"name = "count"
/// parameters = [{ name = "text", type = "string" }]"#)
///     .file("lib/main.txt", "payload")
///     .checksum(DigestAlgorithm::Sha256)
///     .write(root.path());
/// ```
#[derive(Debug, Clone)]
pub struct ExtensionFixture {
    id: String,
    name: String,
    version: String,
    dir_name: Option<String>,
    entry_point: Option<String>,
    default_enabled: Option<bool>,
    dependencies: Vec<(String, String)>,
    actions: Vec<Table>,
    files: Vec<(PathBuf, Vec<u8>)>,
    checksum: Option<DigestAlgorithm>,
    wrong_checksum: bool,
    manifest_file: String,
    extra: Table,
}

impl ExtensionFixture {
    /// A fixture for `(id, version)` with entry point `builtin:{id}`.
    #[must_use]
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: version.into(),
            dir_name: None,
            entry_point: None,
            default_enabled: None,
            dependencies: Vec::new(),
            actions: Vec::new(),
            files: Vec::new(),
            checksum: None,
            wrong_checksum: false,
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            extra: Table::new(),
        }
    }

    /// Directory name under the root. Defaults to `{id}-{version}`.
    #[must_use]
    pub fn dir_name(mut self, name: impl Into<String>) -> Self {
        self.dir_name = Some(name.into());
        self
    }

    /// Override the entry point.
    #[must_use]
    pub fn entry_point(mut self, locator: impl Into<String>) -> Self {
        self.entry_point = Some(locator.into());
        self
    }

    /// Declare `default_enabled = false`.
    #[must_use]
    pub fn disabled_by_default(mut self) -> Self {
        self.default_enabled = Some(false);
        self
    }

    /// Declare a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>, specifier: impl Into<String>) -> Self {
        self.dependencies.push((id.into(), specifier.into()));
        self
    }

    /// Declare a parameterless action.
    #[must_use]
    pub fn action(self, name: &str) -> Self {
        self.action_toml(&format!("name = \"{name}\""))
    }

    /// Declare a parameterless streaming action.
    #[must_use]
    pub fn streaming_action(self, name: &str) -> Self {
        self.action_toml(&format!("name = \"{name}\"\nstreaming = true"))
    }

    /// Declare an action from the TOML body of its `[[actions]]` entry.
    ///
    /// # Panics
    ///
    /// Panics if `body` is not valid TOML.
    #[must_use]
    pub fn action_toml(mut self, body: &str) -> Self {
        let table: Table = toml::from_str(body).expect("action fixture must be valid TOML");
        self.actions.push(table);
        self
    }

    /// Set an arbitrary top-level manifest key.
    #[must_use]
    pub fn manifest_key(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Add a payload file at `path`, relative to the extension directory.
    #[must_use]
    pub fn file(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.into(), contents.into()));
        self
    }

    /// Declare a correct checksum computed with `algorithm`.
    #[must_use]
    pub fn checksum(mut self, algorithm: DigestAlgorithm) -> Self {
        self.checksum = Some(algorithm);
        self.wrong_checksum = false;
        self
    }

    /// Declare a well-formed SHA-256 checksum that does not match the package.
    #[must_use]
    pub fn wrong_checksum(mut self) -> Self {
        self.checksum = Some(DigestAlgorithm::Sha256);
        self.wrong_checksum = true;
        self
    }

    /// Write the manifest under a different file name.
    #[must_use]
    pub fn manifest_file(mut self, name: impl Into<String>) -> Self {
        self.manifest_file = name.into();
        self
    }

    /// Parsed id.
    ///
    /// # Panics
    ///
    /// Panics if the fixture id is invalid.
    #[must_use]
    pub fn id(&self) -> ExtensionId {
        ExtensionId::new(self.id.as_str()).expect("fixture id must be valid")
    }

    /// Parsed version.
    ///
    /// # Panics
    ///
    /// Panics if the fixture version is invalid.
    #[must_use]
    pub fn version(&self) -> Version {
        Version::parse(&self.version).expect("fixture version must be valid")
    }

    /// Directory this fixture writes to under `root`.
    #[must_use]
    pub fn location(&self, root: &Path) -> PathBuf {
        root.join(
            self.dir_name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", self.id, self.version)),
        )
    }

    /// Write the extension under `root`, returning its directory.
    ///
    /// # Panics
    ///
    /// Panics on I/O failure.
    pub fn write(&self, root: &Path) -> PathBuf {
        self.write_inner(root, None)
    }

    /// Write the extension and sign it with `key`.
    ///
    /// # Panics
    ///
    /// Panics on I/O failure or an invalid manifest.
    pub fn write_signed(&self, root: &Path, key: &KeyPair) -> PathBuf {
        self.write_inner(root, Some(key))
    }

    fn write_inner(&self, root: &Path, key: Option<&KeyPair>) -> PathBuf {
        let dir = self.location(root);
        std::fs::create_dir_all(&dir).expect("create extension directory");
        for (path, contents) in &self.files {
            let path = dir.join(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("create payload directory");
            }
            std::fs::write(&path, contents).expect("write payload file");
        }

        let mut doc = self.document();
        if let Some(algorithm) = self.checksum {
            let digest = if self.wrong_checksum {
                capstan_crypto::ContentDigest::compute(algorithm, b"not the package").to_hex()
            } else {
                package_digest(&dir, algorithm, &self.manifest_file)
                    .expect("digest package")
                    .to_hex()
            };
            let mut checksum = Table::new();
            checksum.insert("algorithm".into(), algorithm.as_str().into());
            checksum.insert("digest".into(), digest.into());
            doc.insert("checksum".into(), Value::Table(checksum));
        }
        if let Some(key) = key {
            let manifest = capstan_runtime::validate(&doc).expect("fixture manifest must be valid");
            let spec =
                sign_package(key, &dir, &self.manifest_file, &manifest).expect("sign package");
            let mut signature = Table::new();
            signature.insert("method".into(), spec.method.as_str().into());
            signature.insert("key_id".into(), spec.key_id.into());
            signature.insert("value".into(), spec.value.into());
            doc.insert("signature".into(), Value::Table(signature));
        }

        let text = toml::to_string(&doc).expect("serialize manifest");
        std::fs::write(dir.join(&self.manifest_file), text).expect("write manifest");
        dir
    }

    fn document(&self) -> Table {
        let mut doc = Table::new();
        doc.insert("id".into(), self.id.clone().into());
        doc.insert("name".into(), self.name.clone().into());
        doc.insert("version".into(), self.version.clone().into());
        doc.insert(
            "entry_point".into(),
            self.entry_point
                .clone()
                .unwrap_or_else(|| format!("builtin:{}", self.id))
                .into(),
        );
        if let Some(enabled) = self.default_enabled {
            doc.insert("default_enabled".into(), enabled.into());
        }
        if !self.dependencies.is_empty() {
            let deps: Table = self
                .dependencies
                .iter()
                .map(|(id, spec)| (id.clone(), Value::String(spec.clone())))
                .collect();
            doc.insert("dependencies".into(), Value::Table(deps));
        }
        if !self.actions.is_empty() {
            let actions = self.actions.iter().cloned().map(Value::Table).collect();
            doc.insert("actions".into(), Value::Array(actions));
        }
        for (key, value) in &self.extra {
            doc.insert(key.clone(), value.clone());
        }
        doc
    }
}

// ---------------------------------------------------------------------------
// Fixtures matching the sample extensions
// ---------------------------------------------------------------------------

/// Manifest for [`WordCount`](crate::WordCount).
#[must_use]
pub fn word_count_fixture(version: &str) -> ExtensionFixture {
    ExtensionFixture::new("word-count", version).action_toml(
        r#"name = "count"
parameters = [
  { name = "text", type = "string", max = 10000 },
  { name = "unique", type = "boolean", required = false },
]"#,
    )
}

/// Manifest for [`Sleeper`](crate::Sleeper).
#[must_use]
pub fn sleeper_fixture(version: &str) -> ExtensionFixture {
    ExtensionFixture::new("sleeper", version).action_toml(
        r#"name = "wait"
parameters = [{ name = "ms", type = "integer", min = 0, max = 10000 }]"#,
    )
}

/// Manifest for [`Counter`](crate::Counter).
#[must_use]
pub fn counter_fixture(version: &str) -> ExtensionFixture {
    ExtensionFixture::new("counter", version)
        .action_toml(
            r#"name = "count"
streaming = true
parameters = [{ name = "to", type = "integer", required = false, min = 0 }]"#,
        )
        .streaming_action("forever")
}

/// Manifest for [`FailingStream`](crate::FailingStream).
#[must_use]
pub fn failing_stream_fixture(version: &str) -> ExtensionFixture {
    ExtensionFixture::new("failing-stream", version).streaming_action("count")
}

/// Manifest for [`Tally`](crate::Tally).
#[must_use]
pub fn tally_fixture(version: &str) -> ExtensionFixture {
    ExtensionFixture::new("tally", version)
        .action("increment")
        .action("peek")
}

/// Manifest for [`Faulty`](crate::Faulty).
#[must_use]
pub fn faulty_fixture(version: &str) -> ExtensionFixture {
    ExtensionFixture::new("faulty", version)
        .action("crash")
        .action("crash_later")
        .streaming_action("crash_stream")
}

/// Manifest for [`Pinger`](crate::Pinger).
#[must_use]
pub fn pinger_fixture(id: &str, version: &str) -> ExtensionFixture {
    ExtensionFixture::new(id, version)
        .entry_point("builtin:pinger")
        .action("ping")
}
