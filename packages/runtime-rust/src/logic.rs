//! The seam between the runtime and service implementations.
//!
//! A deployed service is backed by a [`ServiceLogic`] value created from the
//! [`ImplementationCatalog`] entry named in its descriptor. The runtime owns
//! scheduling: it calls `ingest` once per delivered record and `produce` on
//! every production tick of a source, never concurrently for one instance.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use flowyard_core::{ArtifactId, ConfigMap, Record, ServiceId, ServiceSpec};

use crate::ingest::{Ingestor, Outputs};

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context handed to an implementation when its service starts.
#[derive(Clone)]
pub struct ServiceContext {
    pub service_id: ServiceId,
    pub artifact_id: ArtifactId,
    config: Arc<ArcSwap<ConfigMap>>,
    outputs: Outputs,
}

impl ServiceContext {
    pub(crate) fn new(
        service_id: ServiceId,
        artifact_id: ArtifactId,
        config: Arc<ArcSwap<ConfigMap>>,
        outputs: Outputs,
    ) -> Self {
        Self {
            service_id,
            artifact_id,
            config,
            outputs,
        }
    }

    /// Current configuration snapshot. Replaced wholesale on reconfigure.
    #[must_use]
    pub fn config(&self) -> Arc<ConfigMap> {
        self.config.load_full()
    }

    /// Handle for pushing records into a declared output.
    #[must_use]
    pub fn ingestor(&self, output: &str) -> Option<Ingestor> {
        self.outputs.get(output)
    }

    #[must_use]
    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }
}

// ---------------------------------------------------------------------------
// ServiceLogic trait
// ---------------------------------------------------------------------------

/// Behaviour of one deployed service. Every callback defaults to a no-op.
///
/// Errors returned from `ingest` and `produce` are logged and the record or
/// tick is skipped; errors from the lifecycle callbacks fail the transition.
#[async_trait]
pub trait ServiceLogic: Send + 'static {
    /// Called on AVAILABLE -> RUNNING, before any record is delivered.
    async fn start(&mut self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handles one record delivered on the named input.
    async fn ingest(
        &mut self,
        _input: &str,
        _record: Record,
        _outputs: &Outputs,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Production tick of a source service.
    async fn produce(&mut self, _outputs: &Outputs) -> anyhow::Result<()> {
        Ok(())
    }

    async fn passivate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn activate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Validates a full replacement configuration. Returning an error rejects
    /// it and leaves the previous configuration in place.
    fn reconfigure(&mut self, _config: &ConfigMap) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once on the way to STOPPED, after delivery has ceased.
    async fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ServiceFactory / ImplementationCatalog
// ---------------------------------------------------------------------------

/// Creates fresh `ServiceLogic` values for a declared service.
pub trait ServiceFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the declared service cannot be instantiated.
    fn create(&self, spec: &ServiceSpec) -> anyhow::Result<Box<dyn ServiceLogic>>;
}

impl<F> ServiceFactory for F
where
    F: Fn(&ServiceSpec) -> anyhow::Result<Box<dyn ServiceLogic>> + Send + Sync,
{
    fn create(&self, spec: &ServiceSpec) -> anyhow::Result<Box<dyn ServiceLogic>> {
        self(spec)
    }
}

/// Implementation name -> factory.
///
/// Descriptors refer to implementations by name; an artifact naming an
/// unregistered implementation is rejected at load time.
#[derive(Default)]
pub struct ImplementationCatalog {
    factories: DashMap<String, Arc<dyn ServiceFactory>>,
}

impl ImplementationCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the built-in implementations.
    #[must_use]
    pub fn with_builtins() -> Self {
        let catalog = Self::new();
        crate::builtin::register_builtins(&catalog);
        catalog
    }

    /// Registers (or replaces) a factory under `name`.
    pub fn register(&self, name: impl Into<String>, factory: impl ServiceFactory + 'static) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Sorted names of all registered implementations.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Instantiates `name` for `spec`. `None` if the name is unknown.
    pub fn create(
        &self,
        name: &str,
        spec: &ServiceSpec,
    ) -> Option<anyhow::Result<Box<dyn ServiceLogic>>> {
        let factory = self.factories.get(name)?.value().clone();
        Some(factory.create(spec))
    }
}
