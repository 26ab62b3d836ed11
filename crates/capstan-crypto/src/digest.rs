//! Content digests for package checksums.
//!
//! Supports SHA-256, SHA-512 and BLAKE3. Digests compare in constant time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, CryptoResult};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256 (32 bytes).
    Sha256,
    /// SHA-512 (64 bytes).
    Sha512,
    /// BLAKE3 (32 bytes).
    Blake3,
}

impl DigestAlgorithm {
    /// All supported algorithms.
    pub const ALL: [Self; 3] = [Self::Sha256, Self::Sha512, Self::Blake3];

    /// Canonical lowercase name as written in manifests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }

    /// Output length in bytes.
    #[must_use]
    pub const fn output_len(self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 32,
            Self::Sha512 => 64,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s)
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm(s.to_string()))
    }
}

/// A computed or declared digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl ContentDigest {
    /// Digest a single buffer.
    #[must_use]
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        let mut hasher = DigestHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    /// Parse a hex digest declared for `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidHexEncoding`] for malformed hex and
    /// [`CryptoError::InvalidDigestLength`] when the length does not fit the algorithm.
    pub fn from_hex(algorithm: DigestAlgorithm, s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidHexEncoding)?;
        if bytes.len() != algorithm.output_len() {
            return Err(CryptoError::InvalidDigestLength {
                algorithm: algorithm.as_str(),
                expected: algorithm.output_len(),
                actual: bytes.len(),
            });
        }
        Ok(Self { algorithm, bytes })
    }

    /// The algorithm that produced this digest.
    #[must_use]
    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Constant-time equality. Digests of different algorithms never match.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && bool::from(self.bytes.ct_eq(&other.bytes))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({}:{})", self.algorithm, self.to_hex())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

/// Incremental hasher over any supported algorithm.
pub enum DigestHasher {
    /// SHA-256 state.
    Sha256(Sha256),
    /// SHA-512 state.
    Sha512(Sha512),
    /// BLAKE3 state.
    Blake3(Box<blake3::Hasher>),
}

impl DigestHasher {
    /// Start a new hash.
    #[must_use]
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
            DigestAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Absorb more data.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            },
        }
    }

    /// Finish and return the digest.
    #[must_use]
    pub fn finalize(self) -> ContentDigest {
        let (algorithm, bytes) = match self {
            Self::Sha256(h) => (DigestAlgorithm::Sha256, h.finalize().to_vec()),
            Self::Sha512(h) => (DigestAlgorithm::Sha512, h.finalize().to_vec()),
            Self::Blake3(h) => (DigestAlgorithm::Blake3, h.finalize().as_bytes().to_vec()),
        };
        ContentDigest { algorithm, bytes }
    }
}

impl fmt::Debug for DigestHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self {
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Sha512(_) => DigestAlgorithm::Sha512,
            Self::Blake3(_) => DigestAlgorithm::Blake3,
        };
        f.debug_tuple("DigestHasher").field(&algorithm).finish()
    }
}
