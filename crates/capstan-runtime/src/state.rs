//! Per-extension state store.
//!
//! Each `(id, version)` owns one namespace, `{id}@{version}`, in the
//! configured [`StateBackend`]. Extensions only ever receive a
//! [`StateHandle`] built from their own id and version, so there is no way
//! for one extension to name another's blob.

use std::sync::Arc;

use capstan_storage::{MemoryStateBackend, ScopedState, StateBackend};
use semver::Version;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::RuntimeResult;
use crate::id::ExtensionId;

/// Namespace owned by `(id, version)`.
#[must_use]
pub fn namespace(id: &ExtensionId, version: &Version) -> String {
    format!("{id}@{version}")
}

/// Handle to one extension's state blob.
#[derive(Debug, Clone)]
pub struct StateHandle {
    scoped: ScopedState,
}

impl StateHandle {
    /// Namespace this handle is bound to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.scoped.namespace()
    }

    /// Replace the blob atomically.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) on backend failure.
    pub async fn save(&self, blob: Vec<u8>) -> RuntimeResult<()> {
        Ok(self.scoped.save(blob).await?)
    }

    /// The blob, or `None` if never saved.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) on backend failure.
    pub async fn load(&self) -> RuntimeResult<Option<Vec<u8>>> {
        Ok(self.scoped.load().await?)
    }

    /// Remove the blob. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) on backend failure.
    pub async fn clear(&self) -> RuntimeResult<bool> {
        Ok(self.scoped.clear().await?)
    }

    /// Save `value` as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) on
    /// serialization or backend failure.
    pub async fn save_json<T: Serialize + Sync>(&self, value: &T) -> RuntimeResult<()> {
        Ok(self.scoped.save_json(value).await?)
    }

    /// Load a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) on
    /// deserialization or backend failure.
    pub async fn load_json<T: DeserializeOwned>(&self) -> RuntimeResult<Option<T>> {
        Ok(self.scoped.load_json().await?)
    }
}

/// Host-side access to extension state.
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStateBackend::new()))
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Store state in `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    /// Handle bound to `(id, version)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) if the
    /// namespace is rejected by the backend rules.
    pub fn handle(&self, id: &ExtensionId, version: &Version) -> RuntimeResult<StateHandle> {
        let scoped = ScopedState::new(Arc::clone(&self.backend), namespace(id, version))?;
        Ok(StateHandle { scoped })
    }

    /// Replace the blob of `(id, version)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) on backend failure.
    pub async fn save(&self, id: &ExtensionId, version: &Version, blob: Vec<u8>) -> RuntimeResult<()> {
        self.handle(id, version)?.save(blob).await
    }

    /// The blob of `(id, version)`, or `None` if never saved.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) on backend failure.
    pub async fn load(&self, id: &ExtensionId, version: &Version) -> RuntimeResult<Option<Vec<u8>>> {
        self.handle(id, version)?.load().await
    }

    /// Remove the blob of `(id, version)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`](crate::RuntimeError::Storage) on backend failure.
    pub async fn remove(&self, id: &ExtensionId, version: &Version) -> RuntimeResult<bool> {
        self.handle(id, version)?.clear().await
    }
}
