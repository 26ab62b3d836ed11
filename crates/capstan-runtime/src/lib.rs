//! Capstan Runtime - extension discovery, versioning and execution.
//!
//! This crate provides:
//! - Manifest parsing with complete, field-level diagnostics
//! - Checksum and Ed25519 signature verification of extension packages
//! - A discovery engine with a timestamp-validated cache
//! - A version registry resolving specifiers such as `^1.2` or `>=2.0, <3`
//! - Activation with dependency checks and one active version per id
//! - Uniform dispatch of direct, suspending and streaming handlers
//! - Per-`(id, version)` state persistence
//!
//! # Example
//!
//! ```rust,no_run
//! use capstan_runtime::{ExtensionId, FactoryLoader, Runtime};
//! use serde_json::json;
//!
//! # async fn run(loader: FactoryLoader) -> Result<(), capstan_runtime::RuntimeError> {
//! let runtime = Runtime::builder()
//!     .root("/opt/extensions")
//!     .loader(loader)
//!     .build();
//!
//! let report = runtime.scan().await;
//! for error in &report.errors {
//!     eprintln!("{error}");
//! }
//!
//! let id = ExtensionId::new("word-count")?;
//! runtime.activate_resolved(&id, None).await?;
//! let output = runtime.invoke(&id, "count", json!({"text": "a b c"}), None).await?;
//! println!("{:?}", output.into_value());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cache;
pub mod discovery;
pub mod dispatch;
mod error;
mod id;
pub mod integrity;
pub mod lifecycle;
pub mod manifest;
pub mod progress;
pub mod registry;
mod runtime;
pub mod state;
pub mod version;

pub use cache::DiscoveryCache;
pub use discovery::{DiscoveryEngine, DiscoveryError, DiscoveryReport};
pub use dispatch::{
    Extension, ExtensionLoader, FactoryLoader, Handler, HandlerKind, HandlerResult, HandlerTable,
    Invocation, InvocationOutput, LoadRequest, ResultStream,
};
pub use error::{RuntimeError, RuntimeResult};
pub use id::{ExtensionId, MAX_ID_LEN};
pub use integrity::{
    IntegrityPolicy, IntegrityVerifier, PackageVerifier, VerificationResult, VerificationStatus,
};
pub use lifecycle::{ExtensionStatus, InitialState, LifecycleManager, determine_initial_state};
pub use manifest::{Manifest, ValidationError, validate};
pub use progress::{ProgressReporter, ProgressSink, ProgressUpdate};
pub use registry::{RegisteredExtension, VersionRegistry, precedence_key};
pub use runtime::{Runtime, RuntimeBuilder};
pub use state::{StateHandle, StateStore};
pub use version::{SpecifierError, VersionSpecifier};
