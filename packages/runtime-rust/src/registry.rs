//! Artifact registry: artifact identity -> owned service instances and the
//! wiring resolved when the artifact was loaded.
//!
//! Lookups are lock-free (`DashMap`). Structural changes to one artifact
//! (removal, clone, migrate, switch, update) hold its `structure` lock; a
//! second structural request arriving meanwhile is refused rather than
//! queued.

use std::sync::Arc;

use dashmap::DashMap;
use flowyard_core::{ArtifactId, ConfigMap, PortSpec, ServiceId, ServiceKind, ServiceState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use url::Url;

use crate::error::ManagerError;
use crate::instance::ServiceInstance;
use crate::wiring::WiringGraph;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Point-in-time view of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInfo {
    pub id: ArtifactId,
    pub name: String,
    pub locator: String,
    pub created_at: u64,
    pub services: Vec<ServiceId>,
}

/// Point-in-time view of a service instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub artifact_id: ArtifactId,
    pub name: String,
    pub kind: ServiceKind,
    pub state: ServiceState,
    pub version: String,
    pub description: String,
    pub implementation: String,
    pub config: ConfigMap,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
}

// ---------------------------------------------------------------------------
// ArtifactEntry
// ---------------------------------------------------------------------------

/// A registered artifact.
pub(crate) struct ArtifactEntry {
    pub id: ArtifactId,
    pub name: String,
    pub locator: Url,
    pub created_at: u64,
    services: RwLock<Vec<ServiceId>>,
    pub wiring: Mutex<WiringGraph>,
    structure: tokio::sync::Mutex<()>,
}

impl ArtifactEntry {
    pub(crate) fn new(
        id: ArtifactId,
        name: String,
        locator: Url,
        created_at: u64,
        services: Vec<ServiceId>,
        wiring: WiringGraph,
    ) -> Self {
        Self {
            id,
            name,
            locator,
            created_at,
            services: RwLock::new(services),
            wiring: Mutex::new(wiring),
            structure: tokio::sync::Mutex::new(()),
        }
    }

    /// Owned service ids in declaration order.
    pub(crate) fn services(&self) -> Vec<ServiceId> {
        self.services.read().clone()
    }

    pub(crate) fn owns(&self, service: &ServiceId) -> bool {
        self.services.read().contains(service)
    }

    pub(crate) fn push_service(&self, service: ServiceId) {
        self.services.write().push(service);
    }

    /// Puts `new` in the position `old` held.
    pub(crate) fn replace_service(&self, old: &ServiceId, new: ServiceId) {
        let mut services = self.services.write();
        match services.iter().position(|s| s == old) {
            Some(index) => services[index] = new,
            None => services.push(new),
        }
    }

    /// Claims the artifact for a structural change.
    ///
    /// # Errors
    ///
    /// `ConcurrencyConflict` if another structural change holds it.
    pub(crate) fn claim(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, ManagerError> {
        self.structure
            .try_lock()
            .map_err(|_| ManagerError::ConcurrencyConflict {
                target: self.id.to_string(),
            })
    }

    pub(crate) fn info(&self) -> ArtifactInfo {
        ArtifactInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            locator: self.locator.to_string(),
            created_at: self.created_at,
            services: self.services(),
        }
    }
}

// ---------------------------------------------------------------------------
// ArtifactRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct ArtifactRegistry {
    artifacts: DashMap<ArtifactId, Arc<ArtifactEntry>>,
    services: DashMap<ServiceId, Arc<ServiceInstance>>,
}

impl ArtifactRegistry {
    /// Registers an artifact together with all of its instances.
    pub(crate) fn insert(&self, entry: Arc<ArtifactEntry>, instances: Vec<Arc<ServiceInstance>>) {
        for instance in instances {
            self.services.insert(instance.id().clone(), instance);
        }
        self.artifacts.insert(entry.id.clone(), entry);
    }

    pub(crate) fn insert_service(&self, instance: Arc<ServiceInstance>) {
        self.services.insert(instance.id().clone(), instance);
    }

    pub(crate) fn remove_service(&self, id: &ServiceId) -> Option<Arc<ServiceInstance>> {
        self.services.remove(id).map(|(_, instance)| instance)
    }

    /// Removes an artifact and every instance it owns.
    pub(crate) fn remove(&self, id: &ArtifactId) -> Option<Arc<ArtifactEntry>> {
        let (_, entry) = self.artifacts.remove(id)?;
        for service in entry.services() {
            self.services.remove(&service);
        }
        Some(entry)
    }

    pub(crate) fn artifact(&self, id: &ArtifactId) -> Result<Arc<ArtifactEntry>, ManagerError> {
        self.artifacts
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ManagerError::ArtifactNotFound(id.clone()))
    }

    pub(crate) fn service(&self, id: &ServiceId) -> Result<Arc<ServiceInstance>, ManagerError> {
        self.find_service(id)
            .ok_or_else(|| ManagerError::ServiceNotFound(id.clone()))
    }

    pub(crate) fn find_service(&self, id: &ServiceId) -> Option<Arc<ServiceInstance>> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// Resolves a service that must belong to `artifact`.
    pub(crate) fn owned_service(
        &self,
        artifact: &ArtifactEntry,
        id: &ServiceId,
    ) -> Result<Arc<ServiceInstance>, ManagerError> {
        if !artifact.owns(id) {
            return Err(ManagerError::ServiceNotFound(id.clone()));
        }
        self.service(id)
    }

    /// All artifacts, sorted by creation time then id.
    pub(crate) fn artifacts(&self) -> Vec<Arc<ArtifactEntry>> {
        let mut all: Vec<_> = self.artifacts.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// All service instances, sorted by id.
    pub(crate) fn services(&self) -> Vec<Arc<ServiceInstance>> {
        let mut all: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }
}
