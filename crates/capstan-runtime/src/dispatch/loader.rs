//! Entry-point loading.
//!
//! The runtime never loads native code itself. The host hands it an
//! [`ExtensionLoader`] that turns an entry-point locator into an
//! [`Extension`] value.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::Extension;
use crate::manifest::Manifest;
use crate::state::StateHandle;

/// What a loader gets for one activation.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Manifest of the version being activated.
    pub manifest: Manifest,
    /// Directory the extension was discovered in.
    pub source: PathBuf,
    /// State scoped to this `(id, version)`.
    pub state: StateHandle,
}

impl LoadRequest {
    /// The entry-point locator.
    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.manifest.entry_point
    }
}

/// Resolves entry points into live extensions.
#[async_trait]
pub trait ExtensionLoader: Send + Sync {
    /// Instantiate the extension described by `request`.
    ///
    /// # Errors
    ///
    /// Any error fails the activation with `LoadFailed`.
    async fn load(&self, request: LoadRequest) -> anyhow::Result<Box<dyn Extension>>;
}

/// Builds an extension from a load request.
pub type ExtensionFactory =
    Arc<dyn Fn(&LoadRequest) -> anyhow::Result<Box<dyn Extension>> + Send + Sync>;

/// Loader backed by an in-process table of factories keyed by locator.
#[derive(Clone, Default)]
pub struct FactoryLoader {
    factories: HashMap<String, ExtensionFactory>,
}

impl FactoryLoader {
    /// An empty loader. Every locator is unknown.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `locator`.
    #[must_use]
    pub fn with<F>(mut self, locator: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&LoadRequest) -> anyhow::Result<Box<dyn Extension>> + Send + Sync + 'static,
    {
        self.register(locator, factory);
        self
    }

    /// Register `factory` under `locator`, replacing any previous one.
    pub fn register<F>(&mut self, locator: impl Into<String>, factory: F)
    where
        F: Fn(&LoadRequest) -> anyhow::Result<Box<dyn Extension>> + Send + Sync + 'static,
    {
        self.factories.insert(locator.into(), Arc::new(factory));
    }

    /// Whether `locator` has a factory.
    #[must_use]
    pub fn contains(&self, locator: &str) -> bool {
        self.factories.contains_key(locator)
    }
}

#[async_trait]
impl ExtensionLoader for FactoryLoader {
    async fn load(&self, request: LoadRequest) -> anyhow::Result<Box<dyn Extension>> {
        let factory = self
            .factories
            .get(request.entry_point())
            .ok_or_else(|| anyhow::anyhow!("unknown entry point '{}'", request.entry_point()))?;
        factory(&request)
    }
}

impl fmt::Debug for FactoryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut locators: Vec<&String> = self.factories.keys().collect();
        locators.sort();
        f.debug_struct("FactoryLoader")
            .field("locators", &locators)
            .finish()
    }
}
