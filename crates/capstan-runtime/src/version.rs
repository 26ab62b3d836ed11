//! Version specifiers.
//!
//! A specifier is a comma-separated list of clauses, all of which must hold:
//!
//! | Clause | Meaning |
//! |---|---|
//! | `==1.2.0`, `=1.2.0`, `1.2.0` | exactly |
//! | `!=1.2.0` | anything else |
//! | `>=`, `<=`, `>`, `<` | ordering |
//! | `~=1.4.2` / `~=1.4` | `>=1.4.2, <1.5.0` / `>=1.4.0, <2.0.0` |
//! | `^1.2.3` | `>=1.2.3, <2.0.0` (leftmost non-zero component) |
//! | `~1.2.3` | `>=1.2.3, <1.3.0` |
//! | `*` | anything |
//!
//! Versions inside clauses may be partial (`1`, `1.2`) and are zero-filled;
//! pre-release or build suffixes require all three components.
//!
//! A pre-release candidate compared against a stable ordering bound is
//! measured by its release triple, so `2.0.0-beta` satisfies `>=2.0.0` and
//! does not satisfy `<2.0.0`. Against a pre-release bound, and for `==`/`!=`,
//! full semver precedence applies.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::{BuildMetadata, Prerelease, Version};
use serde::{Deserialize, Serialize};

/// A specifier that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version specifier '{input}': {reason}")]
pub struct SpecifierError {
    /// The text that was parsed.
    pub input: String,
    /// What is wrong with it.
    pub reason: String,
}

/// Comparison operator of a single bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
}

impl Op {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
        }
    }
}

/// One normalized bound. Shorthand clauses expand into one or two of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparator {
    /// Operator.
    pub op: Op,
    /// Bound.
    pub version: Version,
}

impl Comparator {
    fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    /// Whether `candidate` satisfies this bound.
    #[must_use]
    pub fn matches(&self, candidate: &Version) -> bool {
        let ord = match self.op {
            Op::Eq | Op::Ne => precedence(candidate, &self.version),
            _ if self.version.pre.is_empty() && !candidate.pre.is_empty() => {
                release(candidate).cmp(&release(&self.version))
            },
            _ => precedence(candidate, &self.version),
        };
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Ge => ord != Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Lt => ord == Ordering::Less,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)
    }
}

fn release(v: &Version) -> (u64, u64, u64) {
    (v.major, v.minor, v.patch)
}

/// Semver precedence: release triple, then pre-release; build metadata ignored.
fn precedence(a: &Version, b: &Version) -> Ordering {
    release(a).cmp(&release(b)).then_with(|| a.pre.cmp(&b.pre))
}

/// A parsed version-range expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpecifier {
    text: String,
    comparators: Vec<Comparator>,
    names_prerelease: bool,
}

impl VersionSpecifier {
    /// Parse a specifier.
    ///
    /// # Errors
    ///
    /// Returns [`SpecifierError`] for empty input, empty clauses, unknown
    /// operators, and unparsable versions.
    pub fn parse(input: &str) -> Result<Self, SpecifierError> {
        let text = input.trim();
        let fail = |reason: String| SpecifierError {
            input: input.to_string(),
            reason,
        };
        if text.is_empty() {
            return Err(fail("specifier is empty".into()));
        }

        let mut comparators = Vec::new();
        let mut names_prerelease = false;
        for clause in text.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                return Err(fail("empty clause".into()));
            }
            let parsed = parse_clause(clause).map_err(fail)?;
            names_prerelease |= parsed.iter().any(|c| !c.version.pre.is_empty());
            comparators.extend(parsed);
        }

        Ok(Self {
            text: text.to_string(),
            comparators,
            names_prerelease,
        })
    }

    /// A specifier matching exactly `version`.
    #[must_use]
    pub fn exact(version: &Version) -> Self {
        Self {
            text: format!("=={version}"),
            comparators: vec![Comparator::new(Op::Eq, version.clone())],
            names_prerelease: !version.pre.is_empty(),
        }
    }

    /// Whether `version` satisfies every clause.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    /// Whether any clause names a pre-release version, which makes
    /// pre-releases eligible during resolution.
    #[must_use]
    pub fn names_prerelease(&self) -> bool {
        self.names_prerelease
    }

    /// Normalized bounds.
    #[must_use]
    pub fn comparators(&self) -> &[Comparator] {
        &self.comparators
    }

    /// The specifier text as written (trimmed).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for VersionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for VersionSpecifier {
    type Err = SpecifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for VersionSpecifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for VersionSpecifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Clause parsing
// ---------------------------------------------------------------------------

/// A clause version plus how many components were written.
struct Partial {
    version: Version,
    components: usize,
}

fn parse_clause(clause: &str) -> Result<Vec<Comparator>, String> {
    if clause == "*" {
        return Ok(Vec::new());
    }

    // Two-character operators first so `>=` is not read as `>`.
    let (operator, rest) = ["==", "!=", ">=", "<=", "~=", ">", "<", "^", "~", "="]
        .iter()
        .find_map(|op| clause.strip_prefix(op).map(|rest| (*op, rest)))
        .unwrap_or(("", clause));

    let rest = rest.trim();
    if rest.is_empty() {
        return Err(format!("clause '{clause}' has no version"));
    }
    if operator.is_empty() && !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("unknown operator in clause '{clause}'"));
    }

    let partial = parse_partial(rest)?;
    let lower = partial.version.clone();

    let comparators = match operator {
        "" | "=" | "==" => vec![Comparator::new(Op::Eq, lower)],
        "!=" => vec![Comparator::new(Op::Ne, lower)],
        ">=" => vec![Comparator::new(Op::Ge, lower)],
        "<=" => vec![Comparator::new(Op::Le, lower)],
        ">" => vec![Comparator::new(Op::Gt, lower)],
        "<" => vec![Comparator::new(Op::Lt, lower)],
        "~=" => {
            if partial.components < 2 {
                return Err(format!(
                    "compatible-release clause '{clause}' needs at least two components"
                ));
            }
            let upper = compatible_upper(&partial)?;
            vec![
                Comparator::new(Op::Ge, lower),
                Comparator::new(Op::Lt, upper),
            ]
        },
        "^" => {
            let upper = caret_upper(&partial)?;
            vec![
                Comparator::new(Op::Ge, lower),
                Comparator::new(Op::Lt, upper),
            ]
        },
        "~" => {
            let upper = tilde_upper(&partial)?;
            vec![
                Comparator::new(Op::Ge, lower),
                Comparator::new(Op::Lt, upper),
            ]
        },
        other => return Err(format!("unknown operator '{other}'")),
    };
    Ok(comparators)
}

fn parse_partial(text: &str) -> Result<Partial, String> {
    if text.contains(['-', '+']) {
        let version =
            Version::parse(text).map_err(|e| format!("invalid version '{text}': {e}"))?;
        return Ok(Partial {
            version,
            components: 3,
        });
    }

    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() > 3 {
        return Err(format!("invalid version '{text}': too many components"));
    }
    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid version '{text}': '{part}' is not a number"));
        }
        *slot = part
            .parse()
            .map_err(|e| format!("invalid version '{text}': {e}"))?;
    }
    let [major, minor, patch] = numbers;
    Ok(Partial {
        version: Version::new(major, minor, patch),
        components: parts.len(),
    })
}

fn bump(n: u64) -> Result<u64, String> {
    n.checked_add(1)
        .ok_or_else(|| "version component overflows".to_string())
}

fn stable(major: u64, minor: u64, patch: u64) -> Version {
    Version {
        major,
        minor,
        patch,
        pre: Prerelease::EMPTY,
        build: BuildMetadata::EMPTY,
    }
}

/// `~=1.4.2` → `<1.5.0`; `~=1.4` → `<2.0.0`.
fn compatible_upper(p: &Partial) -> Result<Version, String> {
    let v = &p.version;
    if p.components == 2 {
        Ok(stable(bump(v.major)?, 0, 0))
    } else {
        Ok(stable(v.major, bump(v.minor)?, 0))
    }
}

/// Bump the leftmost non-zero written component.
fn caret_upper(p: &Partial) -> Result<Version, String> {
    let v = &p.version;
    if v.major > 0 || p.components == 1 {
        Ok(stable(bump(v.major)?, 0, 0))
    } else if v.minor > 0 || p.components == 2 {
        Ok(stable(0, bump(v.minor)?, 0))
    } else {
        Ok(stable(0, 0, bump(v.patch)?))
    }
}

/// `~1` → `<2.0.0`; `~1.2` and `~1.2.3` → `<1.3.0`.
fn tilde_upper(p: &Partial) -> Result<Version, String> {
    let v = &p.version;
    if p.components == 1 {
        Ok(stable(bump(v.major)?, 0, 0))
    } else {
        Ok(stable(v.major, bump(v.minor)?, 0))
    }
}
