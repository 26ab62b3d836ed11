//! Trusted signing keys.
//!
//! Manifests name their signer by key id; only keys added here can verify.

use std::collections::BTreeMap;

use crate::error::{CryptoError, CryptoResult};
use crate::keypair::PublicKey;
use crate::signature::Signature;

/// Set of trusted public keys indexed by hex key id.
///
/// # Example
///
/// ```
/// use capstan_crypto::{KeyPair, TrustedKeys};
///
/// let keypair = KeyPair::generate();
/// let mut trusted = TrustedKeys::new();
/// let key_id = trusted.add(keypair.public_key());
///
/// let signature = keypair.sign(b"payload");
/// assert!(trusted.verify(&key_id, b"payload", &signature).is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: BTreeMap<String, PublicKey>,
}

impl TrustedKeys {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust a key. Returns its key id.
    pub fn add(&mut self, key: PublicKey) -> String {
        let key_id = key.key_id();
        self.keys.insert(key_id.clone(), key);
        key_id
    }

    /// Stop trusting a key. Returns `true` if it was present.
    pub fn remove(&mut self, key_id: &str) -> bool {
        self.keys.remove(key_id).is_some()
    }

    /// Whether `key_id` is trusted.
    #[must_use]
    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    /// Look up a trusted key.
    #[must_use]
    pub fn get(&self, key_id: &str) -> Option<&PublicKey> {
        self.keys.get(key_id)
    }

    /// Number of trusted keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify `signature` over `message` with the key named by `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UntrustedKey`] for unknown ids and
    /// [`CryptoError::SignatureVerificationFailed`] for bad signatures.
    pub fn verify(&self, key_id: &str, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| CryptoError::UntrustedKey(key_id.to_string()))?;
        key.verify(message, signature)
    }
}

impl FromIterator<PublicKey> for TrustedKeys {
    fn from_iter<I: IntoIterator<Item = PublicKey>>(iter: I) -> Self {
        let mut trusted = Self::new();
        for key in iter {
            trusted.add(key);
        }
        trusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    #[test]
    fn test_untrusted_key_rejected() {
        let keypair = KeyPair::generate();
        let trusted = TrustedKeys::new();
        let sig = keypair.sign(b"m");
        assert!(matches!(
            trusted.verify(&keypair.key_id(), b"m", &sig),
            Err(CryptoError::UntrustedKey(_))
        ));
    }

    #[test]
    fn test_key_id_must_match_signer() {
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let trusted: TrustedKeys = [signer.public_key(), other.public_key()]
            .into_iter()
            .collect();
        assert_eq!(trusted.len(), 2);

        let sig = signer.sign(b"m");
        assert!(trusted.verify(&signer.key_id(), b"m", &sig).is_ok());
        assert!(matches!(
            trusted.verify(&other.key_id(), b"m", &sig),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_remove() {
        let keypair = KeyPair::generate();
        let mut trusted = TrustedKeys::new();
        let id = trusted.add(keypair.public_key());
        assert!(trusted.contains(&id));
        assert!(trusted.remove(&id));
        assert!(!trusted.remove(&id));
        assert!(trusted.is_empty());
    }
}
