use parking_lot::RwLock;
use std::collections::HashMap;

use crate::contracts::ModuleHandle;
use crate::errors::EngineError;
use crate::health::{ModuleHealth, ModuleStatus};
use crate::manifest::{ApiSurface, Manifest};

/// One registered module: manifest, capability handle and health record.
/// Owned exclusively by the [`Registry`]; callers only ever see clones.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub manifest: Manifest,
    pub handle: ModuleHandle,
    pub health: ModuleHealth,
}

#[derive(Default)]
struct RegistryInner {
    /// Registration order is preserved; typed views and bus fan-out iterate
    /// in this order for determinism.
    records: Vec<ModuleRecord>,
    index: HashMap<String, usize>,
}

/// Holds registered modules and exposes typed views of the capability
/// table. The module map is the engine's shared mutable state: concurrent
/// reads (bus fan-out, health snapshots) run under the read lock while the
/// serialized lifecycle manager writes.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Fails with `DuplicateRegistration` if the name is
    /// taken and `InvalidManifest` if validation fails or the handle's
    /// identity disagrees with the manifest.
    pub fn register(&self, manifest: Manifest, handle: ModuleHandle) -> Result<(), EngineError> {
        manifest.validate()?;
        if handle.core.name() != manifest.name {
            return Err(EngineError::InvalidManifest(format!(
                "handle name '{}' does not match manifest name '{}'",
                handle.core.name(),
                manifest.name
            )));
        }
        if handle.core.domain() != manifest.domain {
            return Err(EngineError::InvalidManifest(format!(
                "module '{}': handle domain '{}' does not match manifest domain '{}'",
                manifest.name,
                handle.core.domain(),
                manifest.domain
            )));
        }

        let mut inner = self.inner.write();
        if inner.index.contains_key(&manifest.name) {
            return Err(EngineError::DuplicateRegistration(manifest.name.clone()));
        }

        let health = ModuleHealth::new(&manifest);
        let name = manifest.name.clone();
        let idx = inner.records.len();
        inner.records.push(ModuleRecord {
            manifest,
            handle,
            health,
        });
        inner.index.insert(name, idx);
        Ok(())
    }

    /// Remove a module that has never started (or has fully stopped).
    pub fn unregister(&self, name: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        let Some(&idx) = inner.index.get(name) else {
            return Ok(());
        };
        let status = inner.records[idx].health.status;
        if !matches!(
            status,
            ModuleStatus::Registered | ModuleStatus::Stopped | ModuleStatus::Failed
        ) {
            return Err(EngineError::ServiceStillRunning(name.to_string()));
        }
        inner.records.remove(idx);
        inner.index.remove(name);
        // Reindex the tail after the removal.
        let names: Vec<(String, usize)> = inner
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.manifest.name.clone(), i))
            .collect();
        inner.index = names.into_iter().collect();
        Ok(())
    }

    /// Replace a module's manifest. Manifests are immutable while the
    /// module is running.
    pub fn replace_manifest(&self, name: &str, manifest: Manifest) -> Result<(), EngineError> {
        manifest.validate()?;
        if manifest.name != name {
            return Err(EngineError::InvalidManifest(format!(
                "cannot rename module '{name}' to '{}'",
                manifest.name
            )));
        }
        let mut inner = self.inner.write();
        let Some(&idx) = inner.index.get(name) else {
            return Err(EngineError::InvalidManifest(format!(
                "module '{name}' is not registered"
            )));
        };
        let status = inner.records[idx].health.status;
        if !matches!(
            status,
            ModuleStatus::Registered | ModuleStatus::Stopped | ModuleStatus::Failed
        ) {
            return Err(EngineError::ServiceStillRunning(name.to_string()));
        }
        inner.records[idx].manifest = manifest;
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<ModuleRecord> {
        let inner = self.inner.read();
        inner.index.get(name).map(|&i| inner.records[i].clone())
    }

    pub fn handle(&self, name: &str) -> Option<ModuleHandle> {
        let inner = self.inner.read();
        inner.index.get(name).map(|&i| inner.records[i].handle.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// All manifests in registration order.
    pub fn manifests(&self) -> Vec<Manifest> {
        self.inner
            .read()
            .records
            .iter()
            .map(|r| r.manifest.clone())
            .collect()
    }

    /// Modules implementing a capability surface, in registration order.
    pub fn modules_implementing(&self, surface: ApiSurface) -> Vec<(String, ModuleHandle)> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|r| r.handle.implements(surface))
            .map(|r| (r.manifest.name.clone(), r.handle.clone()))
            .collect()
    }

    /// All records in registration order (cloned).
    pub fn records(&self) -> Vec<ModuleRecord> {
        self.inner.read().records.to_vec()
    }

    // ---- health access (single source of truth for status) ----

    /// Apply a mutation to a module's health record; refreshes `updated_at`.
    /// Returns false if the module is unknown.
    pub(crate) fn update_health(&self, name: &str, f: impl FnOnce(&mut ModuleHealth)) -> bool {
        let mut inner = self.inner.write();
        let Some(&idx) = inner.index.get(name) else {
            return false;
        };
        let health = &mut inner.records[idx].health;
        f(health);
        health.touch();
        true
    }

    pub fn health(&self, name: &str) -> Option<ModuleHealth> {
        let inner = self.inner.read();
        inner.index.get(name).map(|&i| inner.records[i].health.clone())
    }

    pub fn health_snapshot(&self) -> Vec<ModuleHealth> {
        self.inner
            .read()
            .records
            .iter()
            .map(|r| r.health.clone())
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .inner
            .read()
            .records
            .iter()
            .map(|r| r.manifest.name.clone())
            .collect();
        f.debug_struct("Registry").field("modules", &names).finish()
    }
}
