//! Capstan Crypto - digests and signatures for extension packages.
//!
//! This crate provides:
//! - SHA-256, SHA-512 and BLAKE3 digests with constant-time comparison
//! - Ed25519 key pairs and signatures
//! - A trusted key set addressed by short hex key ids
//!
//! # Example
//!
//! ```
//! use capstan_crypto::{ContentDigest, DigestAlgorithm, KeyPair};
//!
//! let keypair = KeyPair::generate();
//! let signature = keypair.sign(b"package");
//! assert!(keypair.public_key().verify(b"package", &signature).is_ok());
//!
//! let digest = ContentDigest::compute(DigestAlgorithm::Blake3, b"package");
//! println!("{digest}");
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod digest;
mod error;
mod keypair;
mod signature;
mod trust;

pub use digest::{ContentDigest, DigestAlgorithm, DigestHasher};
pub use error::{CryptoError, CryptoResult};
pub use keypair::{KEY_ID_LEN, KeyPair, PublicKey};
pub use signature::Signature;
pub use trust::TrustedKeys;
