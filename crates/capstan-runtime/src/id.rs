//! Extension identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// Maximum identifier length in bytes.
pub const MAX_ID_LEN: usize = 64;

/// Unique, stable, human-readable extension identifier.
///
/// Lowercase ASCII alphanumerics and hyphens, not starting or ending with a
/// hyphen. The same id names every version of one extension family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExtensionId(String);

/// Deserialize with validation so crafted cache files cannot smuggle in
/// ids that would escape a state namespace.
impl<'de> Deserialize<'de> for ExtensionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl ExtensionId {
    /// Create a new id, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidId`] if the id is malformed.
    pub fn new(id: impl Into<String>) -> RuntimeResult<Self> {
        let id = id.into();
        Self::check(&id).map_err(RuntimeError::InvalidId)?;
        Ok(Self(id))
    }

    /// The inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Describe what is wrong with `id`, if anything.
    pub(crate) fn check(id: &str) -> Result<(), String> {
        if id.is_empty() {
            return Err("extension id must not be empty".into());
        }
        if id.len() > MAX_ID_LEN {
            return Err(format!(
                "extension id must be at most {MAX_ID_LEN} characters, got {}",
                id.len()
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(format!(
                "extension id must contain only lowercase alphanumeric characters and hyphens, got: {id}"
            ));
        }
        if id.starts_with('-') || id.ends_with('-') {
            return Err(format!(
                "extension id must not start or end with a hyphen, got: {id}"
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ExtensionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for ExtensionId {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        for id in ["a", "word-count", "x2", "a-b-c-9"] {
            assert!(ExtensionId::new(id).is_ok(), "{id}");
        }
    }

    #[test]
    fn test_invalid_ids() {
        for id in ["", "-a", "a-", "Upper", "has space", "a_b", "../x", "a@1"] {
            assert!(
                matches!(ExtensionId::new(id), Err(RuntimeError::InvalidId(_))),
                "{id}"
            );
        }
        assert!(ExtensionId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: ExtensionId = serde_json::from_str("\"good-id\"").unwrap();
        assert_eq!(ok.as_str(), "good-id");
        assert!(serde_json::from_str::<ExtensionId>("\"../../etc\"").is_err());
    }
}
