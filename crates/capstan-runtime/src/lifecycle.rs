//! Lifecycle manager.
//!
//! Tracks, per extension id, whether the id is enabled and which version (if
//! any) is active. At most one version of an id is active at a time.
//!
//! ```text
//! Discovered --verification fails--> Rejected
//! Discovered --verification passes--> Registered --activate--> Active
//! Active --deactivate / superseded--> Registered
//! ```
//!
//! This type holds bookkeeping only. Loading and shutting down instances is
//! the runtime's job; it asks [`LifecycleManager::check_activation`] first and
//! records the result with [`LifecycleManager::mark_active`].

use std::collections::{BTreeMap, BTreeSet, HashSet};

use semver::Version;
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};
use crate::id::ExtensionId;
use crate::manifest::Manifest;
use crate::registry::{RegisteredExtension, VersionRegistry};

/// Initial enabled state of a newly registered extension id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialState {
    /// May be activated.
    Enabled,
    /// Refuses activation until enabled.
    Disabled,
}

/// Initial state declared by a manifest.
#[must_use]
pub fn determine_initial_state(manifest: &Manifest) -> InitialState {
    if manifest.default_enabled {
        InitialState::Enabled
    } else {
        InitialState::Disabled
    }
}

/// Where one `(id, version)` stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionStatus {
    /// Registered and usable, not active.
    Registered,
    /// Registered with a failing verification status.
    Rejected,
    /// The active version of its id.
    Active,
}

#[derive(Debug, Clone)]
struct Slot {
    enabled: bool,
    active: Option<Version>,
}

/// Enabled flags and active versions.
#[derive(Debug, Default)]
pub struct LifecycleManager {
    slots: BTreeMap<ExtensionId, Slot>,
    order: Vec<ExtensionId>,
}

impl LifecycleManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a registered manifest. The first manifest seen for an id decides
    /// its initial enabled state; later ones do not override it.
    pub fn track(&mut self, manifest: &Manifest) {
        self.slots.entry(manifest.id.clone()).or_insert_with(|| Slot {
            enabled: determine_initial_state(manifest) == InitialState::Enabled,
            active: None,
        });
    }

    /// Stop tracking an id that has no registered versions left.
    pub fn forget(&mut self, id: &ExtensionId) {
        self.slots.remove(id);
        self.order.retain(|o| o != id);
    }

    /// Whether `id` is tracked.
    #[must_use]
    pub fn is_tracked(&self, id: &ExtensionId) -> bool {
        self.slots.contains_key(id)
    }

    /// Allow activation of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownExtension`] if the id is not tracked.
    pub fn enable(&mut self, id: &ExtensionId) -> RuntimeResult<()> {
        let slot = self.slot_mut(id)?;
        slot.enabled = true;
        info!(extension_id = %id, "Enabled extension");
        Ok(())
    }

    /// Refuse activation of `id`, clearing its active version.
    ///
    /// Returns the version that was active, which the caller must shut down.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::UnknownExtension`] if the id is not tracked.
    pub fn disable(&mut self, id: &ExtensionId) -> RuntimeResult<Option<Version>> {
        let slot = self.slot_mut(id)?;
        slot.enabled = false;
        info!(extension_id = %id, "Disabled extension");
        Ok(self.mark_inactive(id))
    }

    /// Whether `id` is enabled. Unknown ids are not.
    #[must_use]
    pub fn is_enabled(&self, id: &ExtensionId) -> bool {
        self.slots.get(id).is_some_and(|s| s.enabled)
    }

    /// The active version of `id`.
    #[must_use]
    pub fn is_active(&self, id: &ExtensionId) -> Option<Version> {
        self.slots.get(id).and_then(|s| s.active.clone())
    }

    /// Active ids in activation order.
    #[must_use]
    pub fn activation_order(&self) -> Vec<ExtensionId> {
        self.order.clone()
    }

    /// Status of a registry entry.
    #[must_use]
    pub fn status(&self, entry: &RegisteredExtension) -> ExtensionStatus {
        if !entry.is_trusted() {
            ExtensionStatus::Rejected
        } else if self.is_active(entry.id()).as_ref() == Some(entry.version()) {
            ExtensionStatus::Active
        } else {
            ExtensionStatus::Registered
        }
    }

    /// Check that `(id, version)` may be activated.
    ///
    /// The entry must be registered, trusted and enabled, every declared
    /// dependency must resolve, and the resolved dependency graph must be
    /// acyclic. Dependencies are resolved, not activated.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NotRegistered`], [`RuntimeError::Untrusted`],
    /// [`RuntimeError::Disabled`], [`RuntimeError::UnsatisfiedDependency`] or
    /// [`RuntimeError::CyclicDependency`].
    pub fn check_activation<'r>(
        &self,
        registry: &'r VersionRegistry,
        id: &ExtensionId,
        version: &Version,
    ) -> RuntimeResult<&'r RegisteredExtension> {
        let entry = registry
            .get(id, version)
            .ok_or_else(|| RuntimeError::NotRegistered {
                id: id.clone(),
                version: version.clone(),
            })?;
        if !entry.is_trusted() {
            return Err(RuntimeError::Untrusted {
                id: id.clone(),
                version: version.clone(),
            });
        }
        if !self.is_enabled(id) {
            return Err(RuntimeError::Disabled(id.clone()));
        }

        for dep in &entry.manifest.dependencies {
            if registry.resolve(&dep.id, Some(&dep.specifier)).is_err() {
                return Err(RuntimeError::UnsatisfiedDependency {
                    extension: id.clone(),
                    dependency_id: dep.id.clone(),
                    specifier: dep.specifier.to_string(),
                });
            }
        }

        let mut walk = CycleWalk {
            registry,
            stack: Vec::new(),
            done: HashSet::new(),
        };
        if let Some(cycle) = walk.visit(entry) {
            return Err(RuntimeError::CyclicDependency { cycle });
        }
        Ok(entry)
    }

    /// Record `version` as the active version of `id`.
    ///
    /// Returns the superseded version, if another one was active.
    pub fn mark_active(&mut self, id: &ExtensionId, version: Version) -> Option<Version> {
        let slot = self.slots.entry(id.clone()).or_insert(Slot {
            enabled: true,
            active: None,
        });
        let previous = slot.active.replace(version.clone());
        self.order.retain(|o| o != id);
        self.order.push(id.clone());
        match &previous {
            Some(old) if *old != version => {
                info!(extension_id = %id, from = %old, to = %version, "Superseded active version");
            },
            _ => info!(extension_id = %id, %version, "Activated extension"),
        }
        previous
    }

    /// Clear the active version of `id`, returning it.
    pub fn mark_inactive(&mut self, id: &ExtensionId) -> Option<Version> {
        let previous = self.slots.get_mut(id).and_then(|s| s.active.take());
        if let Some(version) = &previous {
            self.order.retain(|o| o != id);
            info!(extension_id = %id, %version, "Deactivated extension");
        }
        previous
    }

    /// Order `ids` so each comes after the ids it depends on.
    ///
    /// Edges come from the manifest of each id's default resolved version and
    /// only connect ids in the input. Ready ids are taken in id order. Ids
    /// caught in a cycle, or without a resolvable version, are appended last
    /// in id order; activating them reports the problem.
    #[must_use]
    pub fn activation_plan(registry: &VersionRegistry, ids: &[ExtensionId]) -> Vec<ExtensionId> {
        let wanted: BTreeSet<&ExtensionId> = ids.iter().collect();
        let mut indegree: BTreeMap<&ExtensionId, usize> = wanted.iter().map(|id| (*id, 0)).collect();
        let mut dependents: BTreeMap<&ExtensionId, Vec<&ExtensionId>> = BTreeMap::new();

        for id in &wanted {
            let Ok(version) = registry.resolve(id, None) else {
                continue;
            };
            let Some(entry) = registry.get(id, &version) else {
                continue;
            };
            for dep in &entry.manifest.dependencies {
                if let Some(dep_id) = wanted.get(&dep.id) {
                    dependents.entry(*dep_id).or_default().push(*id);
                    if let Some(n) = indegree.get_mut(*id) {
                        *n = n.saturating_add(1);
                    }
                }
            }
        }

        let mut ready: BTreeSet<&ExtensionId> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut plan = Vec::with_capacity(wanted.len());
        while let Some(id) = ready.pop_first() {
            plan.push(id.clone());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(*dependent) {
                    *n = n.saturating_sub(1);
                    if *n == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if plan.len() < wanted.len() {
            let placed: HashSet<ExtensionId> = plan.iter().cloned().collect();
            let stuck: Vec<ExtensionId> = wanted
                .into_iter()
                .filter(|id| !placed.contains(*id))
                .cloned()
                .collect();
            debug!(stuck = ?stuck, "Activation plan has unresolved ordering");
            plan.extend(stuck);
        }
        plan
    }

    fn slot_mut(&mut self, id: &ExtensionId) -> RuntimeResult<&mut Slot> {
        self.slots
            .get_mut(id)
            .ok_or_else(|| RuntimeError::UnknownExtension(id.clone()))
    }
}

/// Depth-first search over resolved dependencies.
struct CycleWalk<'r> {
    registry: &'r VersionRegistry,
    stack: Vec<ExtensionId>,
    done: HashSet<ExtensionId>,
}

impl CycleWalk<'_> {
    fn visit(&mut self, entry: &RegisteredExtension) -> Option<Vec<ExtensionId>> {
        let id = entry.id().clone();
        if let Some(pos) = self.stack.iter().position(|s| *s == id) {
            let mut cycle = self.stack.split_off(pos);
            cycle.push(id);
            return Some(cycle);
        }
        if self.done.contains(&id) {
            return None;
        }

        self.stack.push(id.clone());
        for dep in &entry.manifest.dependencies {
            // Unresolvable transitive dependencies are not this walk's concern.
            let Ok(version) = self.registry.resolve(&dep.id, Some(&dep.specifier)) else {
                continue;
            };
            let Some(next) = self.registry.get(&dep.id, &version) else {
                continue;
            };
            if let Some(cycle) = self.visit(next) {
                return Some(cycle);
            }
        }
        self.stack.pop();
        self.done.insert(id);
        None
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;

    use super::*;
    use crate::integrity::VerificationStatus;

    fn register(r: &mut VersionRegistry, id: &str, version: &str, extra: &str) {
        let manifest = Manifest::parse(&format!(
            "id = \"{id}\"\nname = \"{id}\"\nversion = \"{version}\"\nentry_point = \"builtin:{id}\"\n{extra}"
        ))
        .unwrap();
        r.register(RegisteredExtension {
            source: PathBuf::from(format!("/ext/{id}-{version}")),
            manifest,
            status: VerificationStatus::Verified,
            detail: String::new(),
            discovered_at: Utc::now(),
        });
    }

    fn tracked(r: &VersionRegistry) -> LifecycleManager {
        let mut l = LifecycleManager::new();
        for e in r.iter() {
            l.track(&e.manifest);
        }
        l
    }

    fn id(s: &str) -> ExtensionId {
        ExtensionId::new(s).unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_initial_state_follows_manifest() {
        let mut r = VersionRegistry::new();
        register(&mut r, "on", "1.0.0", "");
        register(&mut r, "off", "1.0.0", "default_enabled = false");
        let l = tracked(&r);
        assert!(l.is_enabled(&id("on")));
        assert!(!l.is_enabled(&id("off")));
        assert!(matches!(
            l.check_activation(&r, &id("off"), &v("1.0.0")),
            Err(RuntimeError::Disabled(_))
        ));
    }

    #[test]
    fn test_unsatisfied_dependency() {
        let mut r = VersionRegistry::new();
        register(&mut r, "base", "1.0.0", "");
        register(&mut r, "app", "1.0.0", "[dependencies]\nbase = \">=2.0\"\n");
        let l = tracked(&r);
        match l.check_activation(&r, &id("app"), &v("1.0.0")) {
            Err(RuntimeError::UnsatisfiedDependency {
                dependency_id,
                specifier,
                ..
            }) => {
                assert_eq!(dependency_id, id("base"));
                assert_eq!(specifier, ">=2.0");
            },
            other => panic!("expected UnsatisfiedDependency, got {other:?}"),
        }
        assert_eq!(l.is_active(&id("app")), None);
    }

    #[test]
    fn test_cycle_detected() {
        let mut r = VersionRegistry::new();
        register(&mut r, "a", "1.0.0", "[dependencies]\nb = \"*\"\n");
        register(&mut r, "b", "1.0.0", "[dependencies]\nc = \"*\"\n");
        register(&mut r, "c", "1.0.0", "[dependencies]\na = \"^1\"\n");
        let l = tracked(&r);
        match l.check_activation(&r, &id("a"), &v("1.0.0")) {
            Err(RuntimeError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec![id("a"), id("b"), id("c"), id("a")]);
            },
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_supersede_and_order() {
        let mut r = VersionRegistry::new();
        register(&mut r, "a", "1.0.0", "");
        register(&mut r, "a", "2.0.0", "");
        register(&mut r, "b", "1.0.0", "");
        let mut l = tracked(&r);

        assert_eq!(l.mark_active(&id("a"), v("1.0.0")), None);
        assert_eq!(l.mark_active(&id("b"), v("1.0.0")), None);
        assert_eq!(l.mark_active(&id("a"), v("2.0.0")), Some(v("1.0.0")));
        assert_eq!(l.is_active(&id("a")), Some(v("2.0.0")));
        assert_eq!(l.activation_order(), vec![id("b"), id("a")]);

        let old = r.get(&id("a"), &v("1.0.0")).unwrap();
        assert_eq!(l.status(old), ExtensionStatus::Registered);
        let new = r.get(&id("a"), &v("2.0.0")).unwrap();
        assert_eq!(l.status(new), ExtensionStatus::Active);

        assert_eq!(l.disable(&id("b")).unwrap(), Some(v("1.0.0")));
        assert_eq!(l.activation_order(), vec![id("a")]);
        assert!(l.enable(&id("nope")).is_err());
    }

    #[test]
    fn test_activation_plan_orders_dependencies() {
        let mut r = VersionRegistry::new();
        register(&mut r, "app", "1.0.0", "[dependencies]\nlib = \"*\"\nutil = \"*\"\n");
        register(&mut r, "lib", "1.0.0", "[dependencies]\nutil = \"*\"\n");
        register(&mut r, "util", "1.0.0", "");
        register(&mut r, "zeta", "1.0.0", "");
        let ids: Vec<ExtensionId> = r.ids().cloned().collect();
        assert_eq!(
            LifecycleManager::activation_plan(&r, &ids),
            vec![id("util"), id("lib"), id("app"), id("zeta")]
        );
    }

    #[test]
    fn test_activation_plan_keeps_cycle_members() {
        let mut r = VersionRegistry::new();
        register(&mut r, "a", "1.0.0", "[dependencies]\nb = \"*\"\n");
        register(&mut r, "b", "1.0.0", "[dependencies]\na = \"*\"\n");
        register(&mut r, "c", "1.0.0", "");
        let ids: Vec<ExtensionId> = r.ids().cloned().collect();
        assert_eq!(
            LifecycleManager::activation_plan(&r, &ids),
            vec![id("c"), id("a"), id("b")]
        );
    }
}
