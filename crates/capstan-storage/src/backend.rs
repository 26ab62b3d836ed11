//! State backend trait and implementations.
//!
//! The [`StateBackend`] trait stores one opaque blob per namespace.
//! Implementations:
//!
//! - **In-memory**: for tests and ephemeral hosts
//! - **File**: one file per namespace, replaced atomically on every write
//!
//! # Namespacing
//!
//! Extensions never see this trait. They receive a [`ScopedState`] bound to
//! their own namespace and have no way to name another.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::fs::write_atomic;

/// Maximum namespace length in bytes.
pub const MAX_NAMESPACE_LEN: usize = 255;

/// File extension used by [`FileStateBackend`].
const STATE_FILE_EXTENSION: &str = "state";

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate that a namespace is safe as a map key and as a file name.
///
/// # Errors
///
/// Returns [`StorageError::InvalidNamespace`] if the namespace is empty, too
/// long, `.`/`..`, or contains characters outside `[A-Za-z0-9._+@-]`.
pub fn validate_namespace(namespace: &str) -> StorageResult<()> {
    if namespace.is_empty() {
        return Err(StorageError::InvalidNamespace(
            "namespace must not be empty".into(),
        ));
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(StorageError::InvalidNamespace(format!(
            "namespace exceeds {MAX_NAMESPACE_LEN} bytes"
        )));
    }
    if namespace == "." || namespace == ".." {
        return Err(StorageError::InvalidNamespace(format!(
            "namespace must not be '{namespace}'"
        )));
    }
    if let Some(c) = namespace
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '@' | '-')))
    {
        return Err(StorageError::InvalidNamespace(format!(
            "namespace '{namespace}' contains invalid character {c:?}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Durable medium behind the state store.
///
/// Writes must be atomic with respect to concurrent reads.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the blob stored under `namespace`, or `None` if never written.
    async fn read(&self, namespace: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replace the blob stored under `namespace`.
    async fn write(&self, namespace: &str, blob: Vec<u8>) -> StorageResult<()>;

    /// Remove the blob. Returns `true` if one existed.
    async fn remove(&self, namespace: &str) -> StorageResult<bool>;

    /// List namespaces that currently hold a blob, sorted.
    async fn namespaces(&self) -> StorageResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    data: std::sync::RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStateBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn read(&self, namespace: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_namespace(namespace)?;
        let data = self
            .data
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(data.get(namespace).cloned())
    }

    async fn write(&self, namespace: &str, blob: Vec<u8>) -> StorageResult<()> {
        validate_namespace(namespace)?;
        let mut data = self
            .data
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        data.insert(namespace.to_string(), blob);
        Ok(())
    }

    async fn remove(&self, namespace: &str) -> StorageResult<bool> {
        validate_namespace(namespace)?;
        let mut data = self
            .data
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(data.remove(namespace).is_some())
    }

    async fn namespaces(&self) -> StorageResult<Vec<String>> {
        let data = self
            .data
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// File implementation
// ---------------------------------------------------------------------------

/// File-backed backend: `{directory}/{namespace}.state`.
///
/// Blocking filesystem work runs on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct FileStateBackend {
    directory: PathBuf,
}

impl FileStateBackend {
    /// Store blobs under `directory`. The directory is created on first write.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, namespace: &str) -> StorageResult<PathBuf> {
        validate_namespace(namespace)?;
        Ok(self
            .directory
            .join(format!("{namespace}.{STATE_FILE_EXTENSION}")))
    }
}

async fn run_blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Internal(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn read(&self, namespace: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(namespace)?;
        run_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&path, e)),
        })
        .await
    }

    async fn write(&self, namespace: &str, blob: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(namespace)?;
        run_blocking(move || write_atomic(&path, &blob)).await?;
        debug!(namespace, "Persisted state blob");
        Ok(())
    }

    async fn remove(&self, namespace: &str) -> StorageResult<bool> {
        let path = self.path_for(namespace)?;
        run_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path, e)),
        })
        .await
    }

    async fn namespaces(&self) -> StorageResult<Vec<String>> {
        let directory = self.directory.clone();
        run_blocking(move || {
            let entries = match std::fs::read_dir(&directory) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(StorageError::io(&directory, e)),
            };
            let mut names = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| StorageError::io(&directory, e))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(STATE_FILE_EXTENSION) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                    && validate_namespace(stem).is_ok()
                {
                    names.push(stem.to_string());
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Scoped handle (namespace pre-bound)
// ---------------------------------------------------------------------------

/// A backend handle bound to one namespace.
#[derive(Clone)]
pub struct ScopedState {
    backend: Arc<dyn StateBackend>,
    namespace: String,
}

impl ScopedState {
    /// Bind `backend` to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidNamespace`] if the namespace is invalid.
    pub fn new(backend: Arc<dyn StateBackend>, namespace: impl Into<String>) -> StorageResult<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self { backend, namespace })
    }

    /// The bound namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Replace the stored blob.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn save(&self, blob: Vec<u8>) -> StorageResult<()> {
        self.backend.write(&self.namespace, blob).await
    }

    /// Load the stored blob, `None` if never saved.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn load(&self) -> StorageResult<Option<Vec<u8>>> {
        self.backend.read(&self.namespace).await
    }

    /// Remove the stored blob.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn clear(&self) -> StorageResult<bool> {
        self.backend.remove(&self.namespace).await
    }

    /// Serialize `value` as JSON and save it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] or a backend failure.
    pub async fn save_json<T: Serialize + Sync>(&self, value: &T) -> StorageResult<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.save(bytes).await
    }

    /// Load and deserialize a JSON blob.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] or a backend failure.
    pub async fn load_json<T: DeserializeOwned>(&self) -> StorageResult<Option<T>> {
        match self.load().await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ScopedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedState")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
