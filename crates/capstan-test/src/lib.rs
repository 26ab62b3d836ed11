//! Capstan Test - Shared test utilities for the Capstan extension runtime.
//!
//! This crate provides on-disk extension fixtures, sample extensions with a
//! matching loader, a verifier that counts its calls, and small harness
//! helpers. It is meant to be used as a dev-dependency.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! capstan-test.workspace = true
//! ```
//!
//! ```rust,ignore
//! use capstan_test::{TestRoots, sample_loader, word_count_fixture};
//!
//! #[tokio::test]
//! async fn counts_words() {
//!     let roots = TestRoots::new();
//!     word_count_fixture("1.0.0").write(roots.root());
//!
//!     let runtime = Runtime::builder()
//!         .root(roots.root())
//!         .loader(sample_loader(Default::default()))
//!         .build();
//!     runtime.scan().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
