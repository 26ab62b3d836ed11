//! Capstan Storage - state persistence backends.
//!
//! This crate provides:
//! - The [`StateBackend`] trait, one opaque blob per namespace
//! - [`MemoryStateBackend`] and [`FileStateBackend`] implementations
//! - [`ScopedState`], a handle bound to a single namespace
//! - Atomic file replacement and advisory locking helpers
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use capstan_storage::{MemoryStateBackend, ScopedState, StateBackend};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), capstan_storage::StorageError> {
//! let backend: Arc<dyn StateBackend> = Arc::new(MemoryStateBackend::new());
//! let state = ScopedState::new(backend, "counter@1.0.0")?;
//! state.save(b"42".to_vec()).await?;
//! assert_eq!(state.load().await?, Some(b"42".to_vec()));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod backend;
mod error;
pub mod fs;

pub use backend::{
    FileStateBackend, MAX_NAMESPACE_LEN, MemoryStateBackend, ScopedState, StateBackend,
    validate_namespace,
};
pub use error::{StorageError, StorageResult};
