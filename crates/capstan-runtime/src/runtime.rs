//! The runtime facade.
//!
//! A [`Runtime`] owns one registry, one discovery cache, one lifecycle
//! manager and the live extension instances. It is a cheap handle: clones
//! share state. Activations and deactivations serialize on an activation
//! gate. The shared state lock is never held across a load or a shutdown, so
//! scans and invocations of other extensions proceed while an extension is
//! loading. Invocations take a read lock only long enough to find the
//! instance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use capstan_config::{ConfigError, DEFAULT_MANIFEST_FILE, RuntimeConfig, StateBackendKind};
use capstan_crypto::{PublicKey, TrustedKeys};
use capstan_storage::{FileStateBackend, MemoryStateBackend, StateBackend};
use semver::Version;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::DiscoveryCache;
use crate::discovery::{DiscoveryEngine, DiscoveryReport};
use crate::dispatch::{ExtensionLoader, FactoryLoader, Instance, InvocationOutput, LoadRequest};
use crate::error::{RuntimeError, RuntimeResult};
use crate::id::ExtensionId;
use crate::integrity::{IntegrityPolicy, IntegrityVerifier, PackageVerifier};
use crate::lifecycle::{ExtensionStatus, LifecycleManager};
use crate::progress::ProgressSink;
use crate::registry::{RegisteredExtension, VersionRegistry};
use crate::state::{StateHandle, StateStore};
use crate::version::VersionSpecifier;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and builds a [`Runtime`].
pub struct RuntimeBuilder {
    roots: Vec<PathBuf>,
    manifest_file: String,
    policy: IntegrityPolicy,
    trusted: TrustedKeys,
    cache: Option<DiscoveryCache>,
    state_backend: Option<Arc<dyn StateBackend>>,
    loader: Option<Arc<dyn ExtensionLoader>>,
    verifier: Option<Arc<dyn IntegrityVerifier>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// A builder with no roots, an in-memory cache and state, the standard
    /// verifier and an empty [`FactoryLoader`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            roots: Vec::new(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            policy: IntegrityPolicy::default(),
            trusted: TrustedKeys::new(),
            cache: None,
            state_backend: None,
            loader: None,
            verifier: None,
        }
    }

    /// A builder populated from configuration.
    ///
    /// Trusted keys are decoded here; a declared `key_id` must match the key.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Config`] if a trusted key cannot be decoded,
    /// its key id does not match, or the file backend has no directory.
    pub fn from_config(config: &RuntimeConfig) -> RuntimeResult<Self> {
        let mut trusted = TrustedKeys::new();
        for (i, entry) in config.integrity.trusted_keys.iter().enumerate() {
            let field = format!("integrity.trusted_keys[{i}]");
            let key = PublicKey::from_base64(&entry.public_key).map_err(|e| {
                ConfigError::ValidationError {
                    field: format!("{field}.public_key"),
                    message: e.to_string(),
                }
            })?;
            if let Some(expected) = &entry.key_id
                && *expected != key.key_id()
            {
                return Err(ConfigError::ValidationError {
                    field: format!("{field}.key_id"),
                    message: format!("key id is {}, not {expected}", key.key_id()),
                }
                .into());
            }
            trusted.add(key);
        }

        let state_backend: Arc<dyn StateBackend> = match config.state.backend {
            StateBackendKind::Memory => Arc::new(MemoryStateBackend::new()),
            StateBackendKind::File => {
                let directory = config.state.directory.clone().ok_or_else(|| {
                    ConfigError::ValidationError {
                        field: "state.directory".to_string(),
                        message: "required for the file backend".to_string(),
                    }
                })?;
                Arc::new(FileStateBackend::new(directory))
            },
        };

        let mut builder = Self::new()
            .roots(config.discovery.roots.iter().cloned())
            .manifest_file(config.discovery.manifest_file.clone())
            .policy(IntegrityPolicy {
                require_verified: config.integrity.require_verified,
                register_rejected: config.integrity.register_rejected,
            })
            .trusted_keys(trusted)
            .state_backend(state_backend);
        if let Some(path) = &config.discovery.cache_path {
            builder = builder.cache(DiscoveryCache::open(path));
        }
        Ok(builder)
    }

    /// Add an extension root.
    #[must_use]
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Add several extension roots.
    #[must_use]
    pub fn roots(mut self, roots: impl IntoIterator<Item = PathBuf>) -> Self {
        self.roots.extend(roots);
        self
    }

    /// Manifest file name looked for in each extension directory.
    #[must_use]
    pub fn manifest_file(mut self, name: impl Into<String>) -> Self {
        self.manifest_file = name.into();
        self
    }

    /// Integrity policy.
    #[must_use]
    pub fn policy(mut self, policy: IntegrityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Signers accepted by the standard verifier.
    #[must_use]
    pub fn trusted_keys(mut self, trusted: TrustedKeys) -> Self {
        self.trusted = trusted;
        self
    }

    /// Trust one more signer.
    #[must_use]
    pub fn trust(mut self, key: PublicKey) -> Self {
        self.trusted.add(key);
        self
    }

    /// Discovery cache to use.
    #[must_use]
    pub fn cache(mut self, cache: DiscoveryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// State persistence backend.
    #[must_use]
    pub fn state_backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.state_backend = Some(backend);
        self
    }

    /// Loader turning entry points into extensions.
    #[must_use]
    pub fn loader(mut self, loader: impl ExtensionLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Replace the standard verifier. Trusted keys are then unused.
    #[must_use]
    pub fn verifier(mut self, verifier: Arc<dyn IntegrityVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Build the runtime. Nothing is scanned yet.
    #[must_use]
    pub fn build(self) -> Runtime {
        let verifier = self.verifier.unwrap_or_else(|| {
            Arc::new(PackageVerifier::new(self.trusted).with_manifest_file(&self.manifest_file))
        });
        let engine = DiscoveryEngine::new(verifier)
            .with_policy(self.policy)
            .with_manifest_file(self.manifest_file);
        let state = self
            .state_backend
            .map_or_else(StateStore::default, StateStore::new);
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(FactoryLoader::new()));

        Runtime {
            inner: Arc::new(Inner {
                engine,
                roots: self.roots,
                loader,
                state,
                activation: Mutex::new(()),
                shared: RwLock::new(Shared {
                    registry: VersionRegistry::new(),
                    cache: self.cache.unwrap_or_else(DiscoveryCache::in_memory),
                    lifecycle: LifecycleManager::new(),
                    instances: HashMap::new(),
                }),
            }),
        }
    }
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("roots", &self.roots)
            .field("manifest_file", &self.manifest_file)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Handle to an extension runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    engine: DiscoveryEngine,
    roots: Vec<PathBuf>,
    loader: Arc<dyn ExtensionLoader>,
    state: StateStore,
    activation: Mutex<()>,
    shared: RwLock<Shared>,
}

/// State guarded by the runtime lock.
struct Shared {
    registry: VersionRegistry,
    cache: DiscoveryCache,
    lifecycle: LifecycleManager,
    instances: HashMap<ExtensionId, Arc<Instance>>,
}

impl Shared {
    /// Detach the instance of `id`. The caller shuts it down once the lock
    /// is released.
    fn retire(&mut self, id: &ExtensionId) -> Option<Arc<Instance>> {
        self.instances.remove(id)
    }

    /// Detach every instance whose active version vanished or lost trust.
    fn reconcile(&mut self) -> Vec<Arc<Instance>> {
        let orphaned: Vec<ExtensionId> = self
            .instances
            .iter()
            .filter(|(id, instance)| {
                self.registry
                    .get(id, instance.version())
                    .is_none_or(|entry| !entry.is_trusted())
            })
            .map(|(id, _)| id.clone())
            .collect();
        orphaned
            .into_iter()
            .filter_map(|id| {
                warn!(extension_id = %id, "Active version is no longer usable, deactivating");
                self.lifecycle.mark_inactive(&id);
                self.retire(&id)
            })
            .collect()
    }

    /// Check `(id, version)` and build its load request. `None` when it is
    /// already the active version.
    fn prepare(
        &self,
        inner: &Inner,
        id: &ExtensionId,
        version: &Version,
    ) -> RuntimeResult<Option<LoadRequest>> {
        let entry = self.lifecycle.check_activation(&self.registry, id, version)?;
        if self.lifecycle.is_active(id).as_ref() == Some(version) {
            debug!(extension_id = %id, %version, "Already active");
            return Ok(None);
        }
        Ok(Some(LoadRequest {
            manifest: entry.manifest.clone(),
            source: entry.source.clone(),
            state: inner.state.handle(id, version)?,
        }))
    }

    /// Make a loaded instance the active one, returning the instance it
    /// supersedes.
    ///
    /// Activation is checked again: a scan may have replaced or removed the
    /// entry while it was loading.
    fn install(
        &mut self,
        id: &ExtensionId,
        version: &Version,
        instance: Arc<Instance>,
    ) -> RuntimeResult<Option<Arc<Instance>>> {
        let entry = self.lifecycle.check_activation(&self.registry, id, version)?;
        if entry.manifest != *instance.manifest() {
            return Err(RuntimeError::LoadFailed {
                id: id.clone(),
                version: version.clone(),
                message: "manifest changed while the extension was loading".to_string(),
            });
        }
        self.lifecycle.mark_active(id, version.clone());
        Ok(self.instances.insert(id.clone(), instance))
    }
}

async fn shut_down(retired: impl IntoIterator<Item = Arc<Instance>>) {
    for instance in retired {
        instance.shutdown().await;
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.inner.engine)
            .field("roots", &self.inner.roots)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Start configuring a runtime.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Configured extension roots.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.inner.roots
    }

    // -- Discovery ----------------------------------------------------------

    /// Scan the configured roots.
    pub async fn scan(&self) -> DiscoveryReport {
        self.scan_roots(&self.inner.roots).await
    }

    /// Scan `roots`, register what is found and persist the cache.
    ///
    /// Active versions that were pruned or lost trust are deactivated. A
    /// cache that cannot be persisted is logged, not returned.
    pub async fn scan_roots(&self, roots: &[PathBuf]) -> DiscoveryReport {
        let (report, retired) = {
            let mut shared = self.inner.shared.write().await;
            let shared = &mut *shared;

            let outcome = self
                .inner
                .engine
                .scan(roots, &mut shared.registry, &mut shared.cache);

            for entry in &outcome.report.registered {
                shared.lifecycle.track(&entry.manifest);
            }
            let retired = shared.reconcile();
            for entry in &outcome.pruned {
                if !shared.registry.contains(entry.id()) {
                    shared.lifecycle.forget(entry.id());
                }
            }

            if let Err(e) = shared.cache.flush() {
                warn!(error = %e, "Failed to persist discovery cache");
            }
            (outcome.report, retired)
        };
        shut_down(retired).await;
        report
    }

    // -- Registry -----------------------------------------------------------

    /// Resolve `id` to a concrete version.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoMatchingVersion`] when nothing qualifies.
    pub async fn resolve(
        &self,
        id: &ExtensionId,
        specifier: Option<&VersionSpecifier>,
    ) -> RuntimeResult<Version> {
        self.inner.shared.read().await.registry.resolve(id, specifier)
    }

    /// [`resolve`](Self::resolve) with unparsed inputs.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidId`] or
    /// [`RuntimeError::InvalidSpecifier`] for malformed input, otherwise as
    /// [`resolve`](Self::resolve).
    pub async fn resolve_str(&self, id: &str, specifier: Option<&str>) -> RuntimeResult<Version> {
        let id = ExtensionId::new(id)?;
        let specifier = specifier.map(VersionSpecifier::parse).transpose()?;
        self.resolve(&id, specifier.as_ref()).await
    }

    /// Every registered version of `id`, ascending.
    pub async fn versions(&self, id: &ExtensionId) -> Vec<Version> {
        self.inner.shared.read().await.registry.versions(id)
    }

    /// Every registry entry, by id then version.
    pub async fn registered(&self) -> Vec<RegisteredExtension> {
        self.inner
            .shared
            .read()
            .await
            .registry
            .iter()
            .cloned()
            .collect()
    }

    /// Status of `(id, version)`, or `None` if it is not registered.
    pub async fn status(&self, id: &ExtensionId, version: &Version) -> Option<ExtensionStatus> {
        let shared = self.inner.shared.read().await;
        shared
            .registry
            .get(id, version)
            .map(|entry| shared.lifecycle.status(entry))
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Activate `(id, version)`, superseding any other active version of `id`.
    ///
    /// Activating the version that is already active does nothing. If loading
    /// fails, the previously active version stays active. Other extensions
    /// stay invocable while the loader runs.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotRegistered`], [`RuntimeError::Untrusted`],
    /// [`RuntimeError::Disabled`], [`RuntimeError::UnsatisfiedDependency`],
    /// [`RuntimeError::CyclicDependency`] or [`RuntimeError::LoadFailed`].
    pub async fn activate(&self, id: &ExtensionId, version: &Version) -> RuntimeResult<()> {
        let _gate = self.inner.activation.lock().await;
        self.activate_gated(id, version).await
    }

    /// Load outside the state lock, then install. Callers hold the gate.
    async fn activate_gated(&self, id: &ExtensionId, version: &Version) -> RuntimeResult<()> {
        let request = self.inner.shared.read().await.prepare(&self.inner, id, version)?;
        let Some(request) = request else {
            return Ok(());
        };
        let manifest = request.manifest.clone();
        let state = request.state.clone();

        let extension =
            self.inner
                .loader
                .load(request)
                .await
                .map_err(|e| RuntimeError::LoadFailed {
                    id: id.clone(),
                    version: version.clone(),
                    message: format!("{e:#}"),
                })?;
        let instance = Arc::new(Instance::new(manifest, extension, state)?);

        let installed = self
            .inner
            .shared
            .write()
            .await
            .install(id, version, Arc::clone(&instance));
        match installed {
            Ok(previous) => {
                shut_down(previous).await;
                Ok(())
            },
            Err(e) => {
                warn!(extension_id = %id, %version, error = %e, "Discarding loaded extension");
                instance.shutdown().await;
                Err(e)
            },
        }
    }

    /// Resolve `id` and activate the chosen version.
    ///
    /// # Errors
    ///
    /// As [`resolve`](Self::resolve) and [`activate`](Self::activate).
    pub async fn activate_resolved(
        &self,
        id: &ExtensionId,
        specifier: Option<&VersionSpecifier>,
    ) -> RuntimeResult<Version> {
        let _gate = self.inner.activation.lock().await;
        let version = self.inner.shared.read().await.registry.resolve(id, specifier)?;
        self.activate_gated(id, &version).await?;
        Ok(version)
    }

    /// Activate every enabled id at its default version, dependencies first.
    ///
    /// Returns one result per id, in activation order.
    pub async fn activate_defaults(&self) -> Vec<(ExtensionId, RuntimeResult<Version>)> {
        let _gate = self.inner.activation.lock().await;
        let plan = {
            let shared = self.inner.shared.read().await;
            let enabled: Vec<ExtensionId> = shared
                .registry
                .ids()
                .filter(|id| shared.lifecycle.is_enabled(id))
                .cloned()
                .collect();
            LifecycleManager::activation_plan(&shared.registry, &enabled)
        };

        let mut results = Vec::with_capacity(plan.len());
        for id in plan {
            let resolved = self.inner.shared.read().await.registry.resolve(&id, None);
            let result = match resolved {
                Ok(version) => self.activate_gated(&id, &version).await.map(|()| version),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!(extension_id = %id, error = %e, "Default activation failed");
            }
            results.push((id, result));
        }
        info!(
            activated = results.iter().filter(|(_, r)| r.is_ok()).count(),
            failed = results.iter().filter(|(_, r)| r.is_err()).count(),
            "Default activation complete"
        );
        results
    }

    /// Deactivate `id`, returning the version that was active.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotActive`] if no version of `id` is active.
    pub async fn deactivate(&self, id: &ExtensionId) -> RuntimeResult<Version> {
        let _gate = self.inner.activation.lock().await;
        let (version, retired) = {
            let mut shared = self.inner.shared.write().await;
            let version = shared
                .lifecycle
                .mark_inactive(id)
                .ok_or_else(|| RuntimeError::NotActive(id.clone()))?;
            (version, shared.retire(id))
        };
        shut_down(retired).await;
        Ok(version)
    }

    /// Deactivate everything, most recently activated first.
    pub async fn deactivate_all(&self) {
        let _gate = self.inner.activation.lock().await;
        let retired: Vec<Arc<Instance>> = {
            let mut shared = self.inner.shared.write().await;
            let order = shared.lifecycle.activation_order();
            order
                .iter()
                .rev()
                .filter_map(|id| {
                    shared.lifecycle.mark_inactive(id);
                    shared.retire(id)
                })
                .collect()
        };
        shut_down(retired).await;
    }

    /// Active version of `id`.
    pub async fn is_active(&self, id: &ExtensionId) -> Option<Version> {
        self.inner.shared.read().await.lifecycle.is_active(id)
    }

    /// Active ids in activation order.
    pub async fn activation_order(&self) -> Vec<ExtensionId> {
        self.inner.shared.read().await.lifecycle.activation_order()
    }

    /// Allow `id` to be activated.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownExtension`] if no version is registered.
    pub async fn enable(&self, id: &ExtensionId) -> RuntimeResult<()> {
        self.inner.shared.write().await.lifecycle.enable(id)
    }

    /// Refuse activation of `id`, deactivating it if active.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownExtension`] if no version is registered.
    pub async fn disable(&self, id: &ExtensionId) -> RuntimeResult<()> {
        let _gate = self.inner.activation.lock().await;
        let retired = {
            let mut shared = self.inner.shared.write().await;
            shared.lifecycle.disable(id)?.and_then(|_| shared.retire(id))
        };
        shut_down(retired).await;
        Ok(())
    }

    /// Whether `id` is enabled.
    pub async fn is_enabled(&self, id: &ExtensionId) -> bool {
        self.inner.shared.read().await.lifecycle.is_enabled(id)
    }

    // -- Dispatch -----------------------------------------------------------

    /// Call `action` on the active version of `id`.
    ///
    /// `arguments` must be a JSON object or null. Progress updates pushed by
    /// the handler go to `progress` when given. Streaming actions return
    /// [`InvocationOutput::Stream`]; values are produced as the caller pulls.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotActive`], [`RuntimeError::ActionNotFound`],
    /// [`RuntimeError::InvalidArguments`] or [`RuntimeError::HandlerFailed`].
    pub async fn invoke(
        &self,
        id: &ExtensionId,
        action: &str,
        arguments: Value,
        progress: Option<ProgressSink>,
    ) -> RuntimeResult<InvocationOutput> {
        let instance = {
            let shared = self.inner.shared.read().await;
            shared
                .instances
                .get(id)
                .cloned()
                .ok_or_else(|| RuntimeError::NotActive(id.clone()))?
        };

        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(RuntimeError::InvalidArguments {
                    id: id.clone(),
                    action: action.to_string(),
                    problems: vec![format!("arguments must be an object, got {other}")],
                });
            },
        };
        instance.call(action, arguments, progress).await
    }

    // -- State --------------------------------------------------------------

    /// Replace the state blob of `(id, version)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`] on backend failure.
    pub async fn save(&self, id: &ExtensionId, version: &Version, blob: Vec<u8>) -> RuntimeResult<()> {
        self.inner.state.save(id, version, blob).await
    }

    /// The state blob of `(id, version)`, or `None` if never saved.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`] on backend failure.
    pub async fn load(&self, id: &ExtensionId, version: &Version) -> RuntimeResult<Option<Vec<u8>>> {
        self.inner.state.load(id, version).await
    }

    /// Drop the state blob of `(id, version)`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`] on backend failure.
    pub async fn remove_state(&self, id: &ExtensionId, version: &Version) -> RuntimeResult<bool> {
        self.inner.state.remove(id, version).await
    }

    /// Handle scoped to `(id, version)`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Storage`] if the namespace is rejected.
    pub fn state_handle(&self, id: &ExtensionId, version: &Version) -> RuntimeResult<StateHandle> {
        self.inner.state.handle(id, version)
    }

    /// Manifest of the active version of `id`.
    pub async fn active_manifest(&self, id: &ExtensionId) -> Option<crate::manifest::Manifest> {
        let shared = self.inner.shared.read().await;
        shared.instances.get(id).map(|i| i.manifest().clone())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use capstan_config::TrustedKeyEntry;
    use capstan_crypto::KeyPair;

    use super::*;
    use crate::dispatch::{Extension, HandlerTable};

    struct Noop;

    #[async_trait]
    impl Extension for Noop {
        fn handlers(&self) -> HandlerTable {
            HandlerTable::new()
        }
    }

    fn write_extension(root: &std::path::Path, dir: &str, body: &str) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(DEFAULT_MANIFEST_FILE), body).unwrap();
    }

    fn id(s: &str) -> ExtensionId {
        ExtensionId::new(s).unwrap()
    }

    fn noop_loader() -> FactoryLoader {
        FactoryLoader::new().with("builtin:n", |_| Ok(Box::new(Noop) as Box<dyn Extension>))
    }

    #[test]
    fn test_from_config_checks_key_ids() {
        let key = KeyPair::generate();
        let mut config = RuntimeConfig::default();
        config.integrity.trusted_keys.push(TrustedKeyEntry {
            public_key: key.public_key().to_base64(),
            key_id: Some(key.key_id()),
        });
        assert!(RuntimeBuilder::from_config(&config).is_ok());

        config.integrity.trusted_keys[0].key_id = Some("0000000000000000".into());
        let err = RuntimeBuilder::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("integrity.trusted_keys[0].key_id"), "{err}");

        config.integrity.trusted_keys[0].public_key = "not base64!".into();
        assert!(RuntimeBuilder::from_config(&config).is_err());
    }

    #[test]
    fn test_from_config_file_backend_needs_directory() {
        let mut config = RuntimeConfig::default();
        config.state.backend = StateBackendKind::File;
        assert!(RuntimeBuilder::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_disable_deactivates_and_blocks() {
        let root = tempfile::tempdir().unwrap();
        write_extension(
            root.path(),
            "n",
            "id = \"n\"\nname = \"N\"\nversion = \"1.0.0\"\nentry_point = \"builtin:n\"\n",
        );
        let runtime = Runtime::builder()
            .root(root.path())
            .loader(noop_loader())
            .build();
        runtime.scan().await;

        let v = runtime.activate_resolved(&id("n"), None).await.unwrap();
        assert_eq!(runtime.is_active(&id("n")).await, Some(v.clone()));

        runtime.disable(&id("n")).await.unwrap();
        assert_eq!(runtime.is_active(&id("n")).await, None);
        assert!(matches!(
            runtime.activate(&id("n"), &v).await,
            Err(RuntimeError::Disabled(_))
        ));

        runtime.enable(&id("n")).await.unwrap();
        runtime.activate(&id("n"), &v).await.unwrap();
        assert_eq!(runtime.deactivate(&id("n")).await.unwrap(), v);
        assert!(matches!(
            runtime.deactivate(&id("n")).await,
            Err(RuntimeError::NotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_default_disabled_is_skipped_by_defaults() {
        let root = tempfile::tempdir().unwrap();
        write_extension(
            root.path(),
            "off",
            "id = \"off\"\nname = \"Off\"\nversion = \"1.0.0\"\nentry_point = \"builtin:n\"\ndefault_enabled = false\n",
        );
        let runtime = Runtime::builder()
            .root(root.path())
            .loader(noop_loader())
            .build();
        runtime.scan().await;

        assert!(!runtime.is_enabled(&id("off")).await);
        assert!(runtime.activate_defaults().await.is_empty());
        assert_eq!(runtime.is_active(&id("off")).await, None);
    }

    #[tokio::test]
    async fn test_invoke_rejects_non_object_arguments() {
        let root = tempfile::tempdir().unwrap();
        write_extension(
            root.path(),
            "n",
            "id = \"n\"\nname = \"N\"\nversion = \"1.0.0\"\nentry_point = \"builtin:n\"\n",
        );
        let runtime = Runtime::builder()
            .root(root.path())
            .loader(noop_loader())
            .build();
        runtime.scan().await;
        runtime.activate_resolved(&id("n"), None).await.unwrap();

        let err = runtime
            .invoke(&id("n"), "run", Value::from(3), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArguments { .. }));
    }
}
