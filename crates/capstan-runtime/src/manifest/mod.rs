//! Extension manifest model.
//!
//! A manifest (`extension.toml`) is the declarative contract between an
//! extension author and the runtime: identity, version, entry point, callable
//! actions, dependencies, and optional integrity claims. Manifests are built
//! only through [`validate`] and are never mutated afterwards; a changed file
//! produces a new value on the next scan.

mod validate;

use std::fmt;

use capstan_crypto::{ContentDigest, CryptoResult, DigestAlgorithm};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::id::ExtensionId;
use crate::version::VersionSpecifier;

pub use validate::{ValidationError, Violation, validate};

/// Highest manifest schema this build understands.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// A validated extension manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema revision the document was written against.
    pub schema: u32,
    /// Extension id.
    pub id: ExtensionId,
    /// Display name.
    pub name: String,
    /// Version.
    pub version: Version,
    /// Optional description.
    pub description: Option<String>,
    /// Locator the loader resolves into code.
    pub entry_point: String,
    /// Initial enabled state.
    pub default_enabled: bool,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Direct dependencies, sorted by id.
    pub dependencies: Vec<Dependency>,
    /// Declared actions, in document order.
    pub actions: Vec<ActionSpec>,
    /// Declared package checksum.
    pub checksum: Option<ChecksumSpec>,
    /// Declared package signature.
    pub signature: Option<SignatureSpec>,
    /// Extension-defined configuration schema, kept verbatim.
    pub configuration_schema: Option<toml::Table>,
}

impl Manifest {
    /// Parse and validate a manifest document.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] listing every violation. Unparsable TOML
    /// produces a single violation on `<document>`.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let document: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| ValidationError::document(e.message()))?;
        validate(&document)
    }

    /// Look up a declared action.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Whether the manifest makes any integrity claim.
    #[must_use]
    pub fn declares_integrity(&self) -> bool {
        self.checksum.is_some() || self.signature.is_some()
    }

    /// Re-serialize to a document that validates to an equal manifest.
    #[must_use]
    pub fn to_document(&self) -> toml::Table {
        let mut doc = toml::Table::new();
        doc.insert("schema".into(), toml::Value::Integer(i64::from(self.schema)));
        doc.insert("id".into(), self.id.as_str().into());
        doc.insert("name".into(), self.name.as_str().into());
        doc.insert("version".into(), self.version.to_string().into());
        if let Some(description) = &self.description {
            doc.insert("description".into(), description.as_str().into());
        }
        doc.insert("entry_point".into(), self.entry_point.as_str().into());
        doc.insert("default_enabled".into(), self.default_enabled.into());
        if !self.tags.is_empty() {
            doc.insert("tags".into(), string_array(&self.tags));
        }
        if !self.dependencies.is_empty() {
            let deps: toml::Table = self
                .dependencies
                .iter()
                .map(|d| (d.id.to_string(), d.specifier.to_string().into()))
                .collect();
            doc.insert("dependencies".into(), toml::Value::Table(deps));
        }
        if !self.actions.is_empty() {
            let actions = self
                .actions
                .iter()
                .map(|a| toml::Value::Table(a.to_document()))
                .collect();
            doc.insert("actions".into(), toml::Value::Array(actions));
        }
        if let Some(checksum) = &self.checksum {
            let mut t = toml::Table::new();
            t.insert("algorithm".into(), checksum.algorithm.as_str().into());
            t.insert("digest".into(), checksum.digest.as_str().into());
            doc.insert("checksum".into(), toml::Value::Table(t));
        }
        if let Some(signature) = &self.signature {
            let mut t = toml::Table::new();
            t.insert("method".into(), signature.method.as_str().into());
            t.insert("key_id".into(), signature.key_id.as_str().into());
            t.insert("value".into(), signature.value.as_str().into());
            doc.insert("signature".into(), toml::Value::Table(t));
        }
        if let Some(schema) = &self.configuration_schema {
            doc.insert(
                "configuration_schema".into(),
                toml::Value::Table(schema.clone()),
            );
        }
        doc
    }

    /// [`Self::to_document`] rendered as TOML text.
    #[must_use]
    pub fn to_toml_string(&self) -> String {
        self.to_document().to_string()
    }
}

fn string_array(items: &[String]) -> toml::Value {
    toml::Value::Array(items.iter().map(|s| s.as_str().into()).collect())
}

/// A direct dependency on another extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Required extension.
    pub id: ExtensionId,
    /// Acceptable versions.
    pub specifier: VersionSpecifier,
}

/// A callable operation declared by an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Name, unique within the manifest.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Whether the handler produces a stream of values.
    pub streaming: bool,
    /// Declared parameters.
    pub parameters: Vec<ParameterSpec>,
}

impl ActionSpec {
    /// Look up a declared parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    fn to_document(&self) -> toml::Table {
        let mut t = toml::Table::new();
        t.insert("name".into(), self.name.as_str().into());
        if let Some(description) = &self.description {
            t.insert("description".into(), description.as_str().into());
        }
        t.insert("streaming".into(), self.streaming.into());
        if !self.parameters.is_empty() {
            let params = self
                .parameters
                .iter()
                .map(|p| toml::Value::Table(p.to_document()))
                .collect();
            t.insert("parameters".into(), toml::Value::Array(params));
        }
        t
    }
}

/// Declared type of an action parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// UTF-8 string.
    String,
    /// Whole number.
    Integer,
    /// Any number.
    Number,
    /// `true` / `false`.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
    /// Anything.
    Any,
}

impl ParameterType {
    const ALL: [Self; 7] = [
        Self::String,
        Self::Integer,
        Self::Number,
        Self::Boolean,
        Self::Array,
        Self::Object,
        Self::Any,
    ];

    /// Name as written in manifests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether `min`/`max` apply.
    #[must_use]
    pub const fn is_bounded(self) -> bool {
        matches!(
            self,
            Self::String | Self::Integer | Self::Number | Self::Array
        )
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared action parameter.
///
/// `min`/`max` bound the value of numbers and the length of strings and
/// arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Name, unique within the action.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub kind: ParameterType,
    /// Whether the caller must supply it.
    pub required: bool,
    /// Inclusive lower bound.
    pub min: Option<f64>,
    /// Inclusive upper bound.
    pub max: Option<f64>,
    /// Allowed values (string parameters only).
    pub choices: Option<Vec<String>>,
}

impl ParameterSpec {
    fn to_document(&self) -> toml::Table {
        let mut t = toml::Table::new();
        t.insert("name".into(), self.name.as_str().into());
        t.insert("type".into(), self.kind.as_str().into());
        t.insert("required".into(), self.required.into());
        if let Some(min) = self.min {
            t.insert("min".into(), toml::Value::Float(min));
        }
        if let Some(max) = self.max {
            t.insert("max".into(), toml::Value::Float(max));
        }
        if let Some(choices) = &self.choices {
            t.insert("choices".into(), string_array(choices));
        }
        t
    }
}

/// Declared package checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    /// Digest algorithm.
    pub algorithm: DigestAlgorithm,
    /// Expected digest, lowercase hex.
    pub digest: String,
}

impl ChecksumSpec {
    /// Decode the expected digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest is not valid hex of the right length.
    /// Validated manifests always decode.
    pub fn expected(&self) -> CryptoResult<ContentDigest> {
        ContentDigest::from_hex(self.algorithm, &self.digest)
    }
}

/// Signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMethod {
    /// Ed25519 over the package signing payload.
    Ed25519,
}

impl SignatureMethod {
    /// Name as written in manifests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
        }
    }
}

/// Declared package signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSpec {
    /// Scheme.
    pub method: SignatureMethod,
    /// Id of the signing key.
    pub key_id: String,
    /// Base64 signature.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
id = "word-count"
name = "Word Count"
version = "1.2.0-rc.1+build.5"
description = "Counts words"
entry_point = "builtin:word-count"
default_enabled = false
tags = ["text", "stats"]

[dependencies]
tokenizer = ">=1.0, <2.0"
base = "^0.3"

[[actions]]
name = "count"
description = "Count words"

[[actions.parameters]]
name = "text"
type = "string"
min = 1
max = 10000

[[actions.parameters]]
name = "mode"
type = "string"
required = false
choices = ["words", "lines"]

[[actions]]
name = "tail"
streaming = true

[checksum]
algorithm = "blake3"
digest = "0000000000000000000000000000000000000000000000000000000000000000"

[configuration_schema]
limit = { type = "integer", default = 10 }
"#;

    #[test]
    fn test_parse_full_manifest() {
        let m = Manifest::parse(FULL).unwrap();
        assert_eq!(m.schema, MANIFEST_SCHEMA_VERSION);
        assert_eq!(m.id.as_str(), "word-count");
        assert_eq!(m.version, Version::parse("1.2.0-rc.1+build.5").unwrap());
        assert!(!m.default_enabled);
        assert_eq!(m.tags, vec!["text", "stats"]);
        let dep_ids: Vec<&str> = m.dependencies.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(dep_ids, vec!["base", "tokenizer"]);
        assert_eq!(m.actions.len(), 2);
        assert!(m.action("tail").unwrap().streaming);
        let text = m.action("count").unwrap().parameter("text").unwrap();
        assert_eq!(text.kind, ParameterType::String);
        assert!(text.required);
        assert_eq!(text.min, Some(1.0));
        assert!(m.declares_integrity());
        assert!(m.checksum.as_ref().unwrap().expected().is_ok());
        assert!(m.configuration_schema.is_some());
    }

    #[test]
    fn test_reserialize_is_idempotent() {
        let first = Manifest::parse(FULL).unwrap();
        let second = Manifest::parse(&first.to_toml_string()).unwrap();
        assert_eq!(first, second);
        let third = validate(&second.to_document()).unwrap();
        assert_eq!(second, third);
    }

    #[test]
    fn test_json_roundtrip_for_cache() {
        let m = Manifest::parse(FULL).unwrap();
        let json = serde_json::to_string(&m).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_unparsable_document() {
        let err = Manifest::parse("id = ").unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "<document>");
    }
}
