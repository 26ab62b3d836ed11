//! Manifest validation.
//!
//! Validation walks the raw TOML table instead of deserializing into a struct
//! so that every problem in a document is reported in one pass, each with the
//! dotted path of the offending field (`actions[1].parameters[0].type`).

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use capstan_crypto::{ContentDigest, DigestAlgorithm, KEY_ID_LEN};
use capstan_storage::MAX_NAMESPACE_LEN;
use semver::Version;

use super::{
    ActionSpec, ChecksumSpec, Dependency, MANIFEST_SCHEMA_VERSION, Manifest, ParameterSpec,
    ParameterType, SignatureMethod, SignatureSpec,
};
use crate::id::ExtensionId;
use crate::version::VersionSpecifier;

const TOP_LEVEL_KEYS: &[&str] = &[
    "schema",
    "id",
    "name",
    "version",
    "description",
    "entry_point",
    "default_enabled",
    "tags",
    "dependencies",
    "actions",
    "checksum",
    "signature",
    "configuration_schema",
];
const ACTION_KEYS: &[&str] = &["name", "description", "streaming", "parameters"];
const PARAMETER_KEYS: &[&str] = &["name", "type", "required", "min", "max", "choices"];
const CHECKSUM_KEYS: &[&str] = &["algorithm", "digest"];
const SIGNATURE_KEYS: &[&str] = &["method", "key_id", "value"];

/// One violated field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the field (`<document>` for unparsable input).
    pub field: String,
    /// What is wrong.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A manifest that failed validation, with every violation found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("manifest schema violation: {}", render(violations))]
pub struct ValidationError {
    /// Violations in document order.
    pub violations: Vec<Violation>,
}

fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    pub(crate) fn document(message: impl Into<String>) -> Self {
        Self {
            violations: vec![Violation {
                field: "<document>".into(),
                message: message.into(),
            }],
        }
    }

    /// Paths of the violated fields.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

/// Validate a parsed manifest document.
///
/// # Errors
///
/// Returns a [`ValidationError`] listing every violation when the document
/// does not describe a valid manifest.
pub fn validate(doc: &toml::Table) -> Result<Manifest, ValidationError> {
    let mut c = Checker::default();
    c.unknown_keys(doc, "", TOP_LEVEL_KEYS);

    let schema = c.schema(doc);
    let id = c.required_str(doc, "id", "id").and_then(|s| match ExtensionId::check(&s) {
        Ok(()) => ExtensionId::new(s).ok(),
        Err(message) => {
            c.push("id", message);
            None
        },
    });
    let name = c.required_str(doc, "name", "name");
    if name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        c.push("name", "must not be blank");
    }
    let version = c.required_str(doc, "version", "version").and_then(|s| {
        Version::parse(&s)
            .map_err(|e| c.push("version", format!("'{s}' is not a semantic version: {e}")))
            .ok()
    });
    if let (Some(id), Some(version)) = (&id, &version) {
        let len = crate::state::namespace(id, version).len();
        if len > MAX_NAMESPACE_LEN {
            c.push(
                "version",
                format!(
                    "state namespace would be {len} bytes, above the limit of {MAX_NAMESPACE_LEN}"
                ),
            );
        }
    }
    let description = c.optional_str(doc, "description", "description");
    let entry_point = c.required_str(doc, "entry_point", "entry_point");
    if let Some(ep) = &entry_point {
        if ep.is_empty() {
            c.push("entry_point", "must not be empty");
        } else if ep.chars().any(char::is_whitespace) {
            c.push("entry_point", "must not contain whitespace");
        }
    }
    let default_enabled = c.optional_bool(doc, "default_enabled", "default_enabled");
    let tags = c.string_list(doc, "tags", "tags").unwrap_or_default();
    let dependencies = c.dependencies(doc, id.as_ref());
    let actions = c.actions(doc);
    let checksum = c.checksum(doc);
    let signature = c.signature(doc);
    let configuration_schema = match doc.get("configuration_schema") {
        None => None,
        Some(toml::Value::Table(t)) => Some(t.clone()),
        Some(other) => {
            c.type_mismatch("configuration_schema", "table", other);
            None
        },
    };

    match (id, name, version, entry_point) {
        (Some(id), Some(name), Some(version), Some(entry_point)) if c.violations.is_empty() => {
            Ok(Manifest {
                schema,
                id,
                name,
                version,
                description,
                entry_point,
                default_enabled: default_enabled.unwrap_or(true),
                tags,
                dependencies,
                actions,
                checksum,
                signature,
                configuration_schema,
            })
        },
        _ => Err(ValidationError {
            violations: c.violations,
        }),
    }
}

#[derive(Default)]
struct Checker {
    violations: Vec<Violation>,
}

impl Checker {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            field: field.into(),
            message: message.into(),
        });
    }

    fn type_mismatch(&mut self, field: impl Into<String>, expected: &str, found: &toml::Value) {
        self.push(
            field,
            format!("expected {expected}, found {}", found.type_str()),
        );
    }

    fn unknown_keys(&mut self, table: &toml::Table, prefix: &str, known: &[&str]) {
        for key in table.keys() {
            if !known.contains(&key.as_str()) {
                self.push(join(prefix, key), "unknown field");
            }
        }
    }

    fn required_str(&mut self, table: &toml::Table, key: &str, path: &str) -> Option<String> {
        match table.get(key) {
            None => {
                self.push(path, "missing required field");
                None
            },
            Some(toml::Value::String(s)) => Some(s.clone()),
            Some(other) => {
                self.type_mismatch(path, "string", other);
                None
            },
        }
    }

    fn optional_str(&mut self, table: &toml::Table, key: &str, path: &str) -> Option<String> {
        match table.get(key)? {
            toml::Value::String(s) => Some(s.clone()),
            other => {
                self.type_mismatch(path, "string", other);
                None
            },
        }
    }

    fn optional_bool(&mut self, table: &toml::Table, key: &str, path: &str) -> Option<bool> {
        match table.get(key)? {
            toml::Value::Boolean(b) => Some(*b),
            other => {
                self.type_mismatch(path, "boolean", other);
                None
            },
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn optional_number(&mut self, table: &toml::Table, key: &str, path: &str) -> Option<f64> {
        match table.get(key)? {
            toml::Value::Integer(i) => Some(*i as f64),
            toml::Value::Float(f) if f.is_finite() => Some(*f),
            toml::Value::Float(_) => {
                self.push(path, "must be a finite number");
                None
            },
            other => {
                self.type_mismatch(path, "number", other);
                None
            },
        }
    }

    /// A list of non-empty strings; `None` when absent or malformed.
    fn string_list(&mut self, table: &toml::Table, key: &str, path: &str) -> Option<Vec<String>> {
        let items = match table.get(key)? {
            toml::Value::Array(items) => items,
            other => {
                self.type_mismatch(path, "array of strings", other);
                return None;
            },
        };
        let before = self.violations.len();
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let field = format!("{path}[{i}]");
            match item {
                toml::Value::String(s) if s.is_empty() => self.push(field, "must not be empty"),
                toml::Value::String(s) => out.push(s.clone()),
                other => self.type_mismatch(field, "string", other),
            }
        }
        (self.violations.len() == before).then_some(out)
    }

    fn schema(&mut self, doc: &toml::Table) -> u32 {
        match doc.get("schema") {
            None => MANIFEST_SCHEMA_VERSION,
            Some(toml::Value::Integer(n)) => match u32::try_from(*n) {
                Ok(n) if (1..=MANIFEST_SCHEMA_VERSION).contains(&n) => n,
                _ => {
                    self.push(
                        "schema",
                        format!("unsupported schema {n}; this runtime reads up to {MANIFEST_SCHEMA_VERSION}"),
                    );
                    MANIFEST_SCHEMA_VERSION
                },
            },
            Some(other) => {
                self.type_mismatch("schema", "integer", other);
                MANIFEST_SCHEMA_VERSION
            },
        }
    }

    fn dependencies(&mut self, doc: &toml::Table, own: Option<&ExtensionId>) -> Vec<Dependency> {
        let table = match doc.get("dependencies") {
            None => return Vec::new(),
            Some(toml::Value::Table(t)) => t,
            Some(other) => {
                self.type_mismatch("dependencies", "table", other);
                return Vec::new();
            },
        };

        // Sorted by id so equal documents produce equal manifests.
        let mut deps = BTreeMap::new();
        for (key, value) in table {
            let field = format!("dependencies.{key}");
            let id = match ExtensionId::check(key) {
                Ok(()) => ExtensionId::new(key.as_str()).ok(),
                Err(message) => {
                    self.push(field.clone(), message);
                    None
                },
            };
            if let (Some(id), Some(own)) = (&id, own)
                && id == own
            {
                self.push(field.clone(), "an extension cannot depend on itself");
            }
            let specifier = match value {
                toml::Value::String(s) => VersionSpecifier::parse(s)
                    .map_err(|e| self.push(field.clone(), e.to_string()))
                    .ok(),
                other => {
                    self.type_mismatch(field, "version specifier string", other);
                    None
                },
            };
            if let (Some(id), Some(specifier)) = (id, specifier) {
                deps.insert(id.clone(), Dependency { id, specifier });
            }
        }
        deps.into_values().collect()
    }

    fn actions(&mut self, doc: &toml::Table) -> Vec<ActionSpec> {
        let items = match doc.get("actions") {
            None => return Vec::new(),
            Some(toml::Value::Array(items)) => items,
            Some(other) => {
                self.type_mismatch("actions", "array of tables", other);
                return Vec::new();
            },
        };

        let mut seen = HashSet::new();
        let mut actions = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let path = format!("actions[{i}]");
            let toml::Value::Table(table) = item else {
                self.type_mismatch(path, "table", item);
                continue;
            };
            self.unknown_keys(table, &path, ACTION_KEYS);

            let name = self.required_str(table, "name", &join(&path, "name"));
            if let Some(name) = &name {
                if name.is_empty() {
                    self.push(join(&path, "name"), "must not be empty");
                } else if !seen.insert(name.clone()) {
                    self.push(join(&path, "name"), format!("duplicate action '{name}'"));
                }
            }
            let description = self.optional_str(table, "description", &join(&path, "description"));
            let streaming = self
                .optional_bool(table, "streaming", &join(&path, "streaming"))
                .unwrap_or(false);
            let parameters = self.parameters(table, &path);

            if let Some(name) = name {
                actions.push(ActionSpec {
                    name,
                    description,
                    streaming,
                    parameters,
                });
            }
        }
        actions
    }

    fn parameters(&mut self, action: &toml::Table, action_path: &str) -> Vec<ParameterSpec> {
        let base = join(action_path, "parameters");
        let items = match action.get("parameters") {
            None => return Vec::new(),
            Some(toml::Value::Array(items)) => items,
            Some(other) => {
                self.type_mismatch(base, "array of tables", other);
                return Vec::new();
            },
        };

        let mut seen = HashSet::new();
        let mut params = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let path = format!("{base}[{i}]");
            let toml::Value::Table(table) = item else {
                self.type_mismatch(path, "table", item);
                continue;
            };
            self.unknown_keys(table, &path, PARAMETER_KEYS);

            let name = self.required_str(table, "name", &join(&path, "name"));
            if let Some(name) = &name {
                if name.is_empty() {
                    self.push(join(&path, "name"), "must not be empty");
                } else if !seen.insert(name.clone()) {
                    self.push(join(&path, "name"), format!("duplicate parameter '{name}'"));
                }
            }
            let kind_field = join(&path, "type");
            let kind = self
                .required_str(table, "type", &kind_field)
                .and_then(|t| match ParameterType::from_name(&t) {
                    Some(kind) => Some(kind),
                    None => {
                        self.push(kind_field, format!("unknown parameter type '{t}'"));
                        None
                    },
                });
            let required = self
                .optional_bool(table, "required", &join(&path, "required"))
                .unwrap_or(true);
            let min = self.optional_number(table, "min", &join(&path, "min"));
            let max = self.optional_number(table, "max", &join(&path, "max"));
            let choices = self.string_list(table, "choices", &join(&path, "choices"));

            if let Some(kind) = kind {
                self.check_constraints(&path, kind, min, max, choices.as_deref());
            }

            if let (Some(name), Some(kind)) = (name, kind) {
                params.push(ParameterSpec {
                    name,
                    kind,
                    required,
                    min,
                    max,
                    choices,
                });
            }
        }
        params
    }

    fn check_constraints(
        &mut self,
        path: &str,
        kind: ParameterType,
        min: Option<f64>,
        max: Option<f64>,
        choices: Option<&[String]>,
    ) {
        let is_length = matches!(kind, ParameterType::String | ParameterType::Array);
        for (key, bound) in [("min", min), ("max", max)] {
            let Some(bound) = bound else { continue };
            if !kind.is_bounded() {
                self.push(join(path, key), format!("bounds do not apply to {kind} parameters"));
            } else if is_length && bound < 0.0 {
                self.push(join(path, key), "length bound must not be negative");
            }
        }
        if let (Some(min), Some(max)) = (min, max)
            && min > max
        {
            self.push(join(path, "min"), format!("min {min} exceeds max {max}"));
        }
        if let Some(choices) = choices {
            if kind != ParameterType::String {
                self.push(join(path, "choices"), "choices apply only to string parameters");
            } else if choices.is_empty() {
                self.push(join(path, "choices"), "must not be empty");
            }
        }
    }

    fn checksum(&mut self, doc: &toml::Table) -> Option<ChecksumSpec> {
        let table = match doc.get("checksum")? {
            toml::Value::Table(t) => t,
            other => {
                self.type_mismatch("checksum", "table", other);
                return None;
            },
        };
        self.unknown_keys(table, "checksum", CHECKSUM_KEYS);

        let algorithm = self
            .required_str(table, "algorithm", "checksum.algorithm")
            .and_then(|a| {
                a.parse::<DigestAlgorithm>()
                    .map_err(|e| self.push("checksum.algorithm", e.to_string()))
                    .ok()
            });
        let digest = self.required_str(table, "digest", "checksum.digest");

        let (algorithm, digest) = (algorithm?, digest?);
        let digest = digest.to_ascii_lowercase();
        if let Err(e) = ContentDigest::from_hex(algorithm, &digest) {
            self.push("checksum.digest", e.to_string());
            return None;
        }
        Some(ChecksumSpec { algorithm, digest })
    }

    fn signature(&mut self, doc: &toml::Table) -> Option<SignatureSpec> {
        let table = match doc.get("signature")? {
            toml::Value::Table(t) => t,
            other => {
                self.type_mismatch("signature", "table", other);
                return None;
            },
        };
        self.unknown_keys(table, "signature", SIGNATURE_KEYS);

        let method = self
            .required_str(table, "method", "signature.method")
            .and_then(|m| match m.as_str() {
                "ed25519" => Some(SignatureMethod::Ed25519),
                _ => {
                    self.push("signature.method", format!("unsupported signature method '{m}'"));
                    None
                },
            });
        let key_id = self
            .required_str(table, "key_id", "signature.key_id")
            .and_then(|k| {
                let expected = KEY_ID_LEN.saturating_mul(2);
                if k.len() == expected && k.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
                    Some(k)
                } else {
                    self.push(
                        "signature.key_id",
                        format!("must be {expected} lowercase hex characters"),
                    );
                    None
                }
            });
        let value = self
            .required_str(table, "value", "signature.value")
            .and_then(|v| {
                if v.trim().is_empty() {
                    self.push("signature.value", "must not be empty");
                    None
                } else {
                    Some(v)
                }
            });

        Some(SignatureSpec {
            method: method?,
            key_id: key_id?,
            value: value?,
        })
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> toml::Table {
        text.parse().unwrap()
    }

    fn fields(text: &str) -> Vec<String> {
        validate(&table(text))
            .unwrap_err()
            .violations
            .into_iter()
            .map(|v| v.field)
            .collect()
    }

    const MINIMAL: &str = r#"
id = "echo"
name = "Echo"
version = "0.1.0"
entry_point = "builtin:echo"
"#;

    #[test]
    fn test_state_namespace_must_fit() {
        let id = "a".repeat(64);
        let fits = format!("1.0.0-{}", "x".repeat(184));
        let text = |version: &str| {
            format!("id = \"{id}\"\nname = \"N\"\nversion = \"{version}\"\nentry_point = \"builtin:n\"\n")
        };
        assert!(validate(&table(&text(&fits))).is_ok());

        let long = format!("{fits}y");
        let err = validate(&table(&text(&long))).unwrap_err();
        assert_eq!(err.fields(), ["version"]);
        assert!(err.to_string().contains("256 bytes"), "{err}");
    }

    #[test]
    fn test_minimal_defaults() {
        let m = validate(&table(MINIMAL)).unwrap();
        assert!(m.default_enabled);
        assert!(m.actions.is_empty());
        assert!(m.dependencies.is_empty());
        assert!(!m.declares_integrity());
    }

    #[test]
    fn test_reports_every_violation() {
        let got = fields(
            r#"
id = "Bad_Id"
version = "1.2"
entry_point = ""
default_enabled = "yes"
extra = 1

[dependencies]
other = ">>1"

[[actions]]
name = "run"

[[actions]]
name = "run"

[[actions.parameters]]
name = "n"
type = "float"
"#,
        );
        for expected in [
            "extra",
            "id",
            "name",
            "version",
            "entry_point",
            "default_enabled",
            "dependencies.other",
            "actions[1].name",
            "actions[1].parameters[0].type",
        ] {
            assert!(got.iter().any(|f| f == expected), "missing {expected} in {got:?}");
        }
    }

    #[test]
    fn test_parameter_constraints() {
        let got = fields(
            r#"
id = "p"
name = "P"
version = "1.0.0"
entry_point = "x"

[[actions]]
name = "a"
parameters = [
  { name = "flag", type = "boolean", min = 1 },
  { name = "n", type = "integer", min = 5, max = 1 },
  { name = "s", type = "string", min = -1 },
  { name = "k", type = "integer", choices = ["a"] },
  { name = "s", type = "string", choices = [] },
]
"#,
        );
        assert_eq!(
            got,
            vec![
                "actions[0].parameters[0].min",
                "actions[0].parameters[1].min",
                "actions[0].parameters[2].min",
                "actions[0].parameters[3].choices",
                "actions[0].parameters[4].name",
                "actions[0].parameters[4].choices",
            ]
        );
    }

    #[test]
    fn test_integrity_sections() {
        let got = fields(
            r#"
id = "p"
name = "P"
version = "1.0.0"
entry_point = "x"

[checksum]
algorithm = "md5"
digest = "00"

[signature]
method = "rsa"
key_id = "XYZ"
value = ""
"#,
        );
        assert_eq!(
            got,
            vec![
                "checksum.algorithm",
                "signature.method",
                "signature.key_id",
                "signature.value",
            ]
        );

        assert_eq!(
            fields(&format!(
                "{MINIMAL}\n[checksum]\nalgorithm = \"sha256\"\ndigest = \"abcd\"\n"
            )),
            vec!["checksum.digest"]
        );
    }

    #[test]
    fn test_checksum_digest_is_lowercased() {
        let upper = "AB".repeat(32);
        let m = validate(&table(&format!(
            "{MINIMAL}\n[checksum]\nalgorithm = \"sha256\"\ndigest = \"{upper}\"\n"
        )))
        .unwrap();
        assert_eq!(m.checksum.unwrap().digest, "ab".repeat(32));
    }

    #[test]
    fn test_self_dependency_rejected() {
        assert_eq!(
            fields(&format!("{MINIMAL}\n[dependencies]\necho = \"*\"\n")),
            vec!["dependencies.echo"]
        );
    }

    #[test]
    fn test_future_schema_rejected() {
        assert_eq!(fields(&format!("schema = 2\n{MINIMAL}")), vec!["schema"]);
    }

    #[test]
    fn test_entry_point_whitespace() {
        let doc = MINIMAL.replace("builtin:echo", "builtin: echo");
        assert_eq!(fields(&doc), vec!["entry_point"]);
    }
}
