//! The orchestration facade: every lifecycle and topology operation.
//!
//! Locking discipline:
//! - per service, the instance control lock orders transitions;
//! - per artifact, the structure lock admits one structural operation at a
//!   time (losers fail with `ConcurrencyConflict`);
//! - the wiring lock is short and never held across an await.
//!
//! A transition that awaits between taking the control lock and publishing
//! the new state runs on a task of its own (see [`detach`]). Dropping the
//! caller's future, e.g. on an operation deadline or the teardown grace
//! period, abandons the wait but never the transition.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowyard_core::{
    ArtifactId, ChannelId, ClockSource, ConfigMap, ServiceId, ServiceSpec, ServiceState,
    SystemClock, Transition, WiringDescriptor, WiringError,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::ManagerError;
use crate::ingest::Ingestor;
use crate::instance::ServiceInstance;
use crate::loader::DescriptorLoader;
use crate::logic::{ImplementationCatalog, ServiceLogic};
use crate::notify::{LifecycleEvent, NotificationSink, Notifier};
use crate::registry::{ArtifactEntry, ArtifactInfo, ArtifactRegistry, ServiceInfo};
use crate::wiring::{ChannelSettings, WiringGraph};

/// Registers artifacts and drives the services they contain.
pub struct ServiceManager {
    config: RuntimeConfig,
    loader: Arc<dyn DescriptorLoader>,
    clock: Arc<dyn ClockSource>,
    sequence: AtomicU64,
    driver: Driver,
}

impl ServiceManager {
    /// Creates a manager with an empty registry. Must be called from within a
    /// tokio runtime when notifications are asynchronous.
    #[must_use]
    pub fn new(
        config: RuntimeConfig,
        loader: Arc<dyn DescriptorLoader>,
        catalog: Arc<ImplementationCatalog>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(
            sink,
            config.notification_mode,
            config.notification_queue_capacity,
        ));
        let driver = Driver {
            registry: Arc::new(ArtifactRegistry::default()),
            catalog,
            notifier,
            channels: ChannelSettings {
                capacity: config.channel_capacity,
                enqueue_timeout: config.enqueue_timeout,
            },
            default_period: config.default_source_period,
        };
        Self {
            config,
            loader,
            clock: Arc::new(SystemClock),
            sequence: AtomicU64::new(1),
            driver,
        }
    }

    /// Replaces the clock used to stamp artifact creation times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<ImplementationCatalog> {
        &self.driver.catalog
    }

    fn registry(&self) -> &ArtifactRegistry {
        &self.driver.registry
    }

    // -----------------------------------------------------------------------
    // Registry operations
    // -----------------------------------------------------------------------

    /// Resolves `locator`, validates its wiring and registers the artifact
    /// with all services AVAILABLE. Nothing is registered on failure.
    ///
    /// # Errors
    ///
    /// `InvalidLocator`, `Wiring`, or `ImplementationFailed` if an
    /// implementation cannot be instantiated.
    pub async fn add_artifact(&self, locator: &str) -> Result<ArtifactId, ManagerError> {
        let url = parse_locator(locator)?;
        let descriptor = self.resolve(&url).await?;
        self.check_implementations(&descriptor)?;

        let artifact_id = ArtifactId::new(Uuid::new_v4().to_string());
        let mut instances = Vec::with_capacity(descriptor.services.len());
        for spec in &descriptor.services {
            let id = ServiceId::scoped(&artifact_id, &spec.id);
            let logic = self.driver.instantiate(&id, spec)?;
            instances.push(Arc::new(self.driver.build_instance(
                id,
                &artifact_id,
                spec.clone(),
                spec.config.clone(),
                logic,
            )));
        }

        let edges = descriptor
            .relations
            .iter()
            .map(|relation| ChannelId {
                producer: ServiceId::scoped(&artifact_id, &relation.from.service),
                output: relation.from.port.clone(),
                consumer: ServiceId::scoped(&artifact_id, &relation.to.service),
                input: relation.to.port.clone(),
            })
            .collect();
        let entry = Arc::new(ArtifactEntry::new(
            artifact_id.clone(),
            descriptor.name.clone(),
            url,
            self.clock.now(),
            instances.iter().map(|i| i.id().clone()).collect(),
            WiringGraph::new(edges),
        ));
        let service_count = instances.len();
        self.registry().insert(entry, instances);

        info!(
            artifact_id = %artifact_id,
            name = %descriptor.name,
            services = service_count,
            "artifact added"
        );
        self.driver
            .notifier
            .emit(LifecycleEvent::ArtifactAdded {
                id: artifact_id.clone(),
            })
            .await;
        Ok(artifact_id)
    }

    /// Resolves `locator` and checks its wiring and implementations without
    /// registering anything.
    ///
    /// # Errors
    ///
    /// Same as [`add_artifact`](Self::add_artifact) before registration.
    pub async fn validate(&self, locator: &str) -> Result<WiringDescriptor, ManagerError> {
        let url = parse_locator(locator)?;
        let descriptor = self.resolve(&url).await?;
        self.check_implementations(&descriptor)?;
        Ok(descriptor)
    }

    /// Stops every owned service not yet STOPPED (producers first), then
    /// unregisters the artifact.
    ///
    /// # Errors
    ///
    /// `ArtifactNotFound`, `ConcurrencyConflict` if another structural
    /// operation holds the artifact, or `TeardownTimeout` if the services do
    /// not stop within the grace period. After a timeout the artifact stays
    /// registered; a service whose stop had begun still reaches STOPPED, the
    /// rest keep their state, and a later removal picks up where this one
    /// left off.
    pub async fn remove_artifact(&self, id: &ArtifactId) -> Result<(), ManagerError> {
        let artifact = self.registry().artifact(id)?;
        let _claim = artifact.claim()?;

        let grace = self.config.teardown_grace;
        if tokio::time::timeout(grace, self.retire_all(&artifact))
            .await
            .is_err()
        {
            let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
            warn!(artifact_id = %id, grace_ms, "artifact teardown timed out");
            return Err(ManagerError::TeardownTimeout {
                artifact: id.clone(),
                grace_ms,
            });
        }

        self.registry().remove(id);
        info!(artifact_id = %id, "artifact removed");
        self.driver
            .notifier
            .emit(LifecycleEvent::ArtifactRemoved { id: id.clone() })
            .await;
        Ok(())
    }

    #[must_use]
    pub fn get_artifact(&self, id: &ArtifactId) -> Option<ArtifactInfo> {
        self.registry().artifact(id).ok().map(|entry| entry.info())
    }

    #[must_use]
    pub fn get_artifacts(&self) -> Vec<ArtifactInfo> {
        self.registry().artifacts().iter().map(|e| e.info()).collect()
    }

    #[must_use]
    pub fn get_artifact_ids(&self) -> Vec<ArtifactId> {
        self.registry()
            .artifacts()
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    #[must_use]
    pub fn get_service(&self, id: &ServiceId) -> Option<ServiceInfo> {
        self.registry().find_service(id).map(|s| s.info())
    }

    #[must_use]
    pub fn get_services(&self) -> Vec<ServiceInfo> {
        self.registry().services().iter().map(|s| s.info()).collect()
    }

    #[must_use]
    pub fn get_service_ids(&self) -> Vec<ServiceId> {
        self.registry()
            .services()
            .iter()
            .map(|s| s.id().clone())
            .collect()
    }

    #[must_use]
    pub fn get_state(&self, id: &ServiceId) -> Option<ServiceState> {
        self.registry().find_service(id).map(|s| s.state())
    }

    /// Handle for pushing records into a declared output of a service from
    /// outside the runtime.
    #[must_use]
    pub fn ingestor(&self, service: &ServiceId, output: &str) -> Option<Ingestor> {
        self.registry().find_service(service)?.context().ingestor(output)
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// AVAILABLE -> RUNNING. Opens the channels of the service's edges.
    ///
    /// # Errors
    ///
    /// `ServiceNotFound`, `InvalidStateTransition`, or `ImplementationFailed`
    /// if the implementation's start hook fails (the service stays
    /// AVAILABLE).
    pub async fn start_service(&self, id: &ServiceId) -> Result<(), ManagerError> {
        let instance = self.registry().service(id)?;
        let driver = self.driver.clone();
        detach(id, async move { driver.start(&instance).await }).await
    }

    /// RUNNING | PASSIVATED -> STOPPED. When this returns, the service's
    /// channels are closed and none of its tasks is running.
    ///
    /// # Errors
    ///
    /// `ServiceNotFound` or `InvalidStateTransition`.
    pub async fn stop_service(&self, id: &ServiceId) -> Result<(), ManagerError> {
        let instance = self.registry().service(id)?;
        let driver = self.driver.clone();
        detach(id, async move { driver.stop(&instance).await }).await
    }

    /// RUNNING -> PASSIVATED. Input channels keep buffering.
    ///
    /// # Errors
    ///
    /// `ServiceNotFound`, `InvalidStateTransition`, or `ImplementationFailed`.
    pub async fn passivate(&self, id: &ServiceId) -> Result<(), ManagerError> {
        let instance = self.registry().service(id)?;
        let driver = self.driver.clone();
        detach(id, async move { driver.passivate(&instance).await }).await
    }

    /// PASSIVATED -> RUNNING. Buffered records are delivered first.
    ///
    /// # Errors
    ///
    /// `ServiceNotFound`, `InvalidStateTransition`, or `ImplementationFailed`.
    pub async fn activate(&self, id: &ServiceId) -> Result<(), ManagerError> {
        let instance = self.registry().service(id)?;
        let driver = self.driver.clone();
        detach(id, async move { driver.activate(&instance).await }).await
    }

    /// Replaces the whole configuration of a RUNNING service.
    ///
    /// # Errors
    ///
    /// `ServiceNotFound`, `InvalidStateTransition` if the service is not
    /// RUNNING, or `ConfigurationRejected` (previous configuration kept).
    pub async fn reconfigure(&self, id: &ServiceId, config: ConfigMap) -> Result<(), ManagerError> {
        let instance = self.registry().service(id)?;
        let _control = instance.lock_control().await;
        let current = instance.state();
        if current != ServiceState::Running {
            return Err(ManagerError::InvalidStateTransition {
                service: id.clone(),
                attempted: ServiceState::Running,
                current,
            });
        }

        // Validation and publication happen without an await in between.
        instance
            .reconfigure(config)
            .await
            .map_err(|err| ManagerError::ConfigurationRejected {
                service: id.clone(),
                reason: format!("{err:#}"),
            })?;
        info!(service_id = %id, "service reconfigured");
        Ok(())
    }

    /// Moves a service to `target` through the single legal transition.
    ///
    /// # Errors
    ///
    /// As the corresponding lifecycle operation.
    pub async fn set_state(&self, id: &ServiceId, target: ServiceState) -> Result<(), ManagerError> {
        let current = self
            .get_state(id)
            .ok_or_else(|| ManagerError::ServiceNotFound(id.clone()))?;
        match current
            .transition_to(target)
            .map_err(|err| ManagerError::illegal(id, err))?
        {
            Transition::Start => self.start_service(id).await,
            Transition::Passivate => self.passivate(id).await,
            Transition::Activate => self.activate(id).await,
            Transition::Stop => self.stop_service(id).await,
        }
    }

    /// Starts every AVAILABLE service of the artifact, consumers first.
    ///
    /// # Errors
    ///
    /// `ArtifactNotFound` or the first failing start.
    pub async fn start_artifact(&self, id: &ArtifactId) -> Result<(), ManagerError> {
        let artifact = self.registry().artifact(id)?;
        let mut order = artifact
            .wiring
            .lock()
            .dependency_order(&artifact.services());
        order.reverse();
        for service in order {
            if self.get_state(&service) == Some(ServiceState::Available) {
                self.start_service(&service).await?;
            }
        }
        Ok(())
    }

    /// Stops every running or passivated service of the artifact, producers
    /// first.
    ///
    /// # Errors
    ///
    /// `ArtifactNotFound` or the first failing stop.
    pub async fn stop_artifact(&self, id: &ArtifactId) -> Result<(), ManagerError> {
        let artifact = self.registry().artifact(id)?;
        let order = artifact
            .wiring
            .lock()
            .dependency_order(&artifact.services());
        for service in order {
            if self
                .get_state(&service)
                .is_some_and(ServiceState::holds_bindings)
            {
                self.stop_service(&service).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Topology operations
    // -----------------------------------------------------------------------

    /// Creates an AVAILABLE copy of a service in the same artifact, with a
    /// fresh copy of each of its edges. The copy's implementation starts from
    /// the source's current configuration.
    ///
    /// # Errors
    ///
    /// `NotSupported`, `ArtifactNotFound`, `ServiceNotFound`,
    /// `ConcurrencyConflict`, or `ImplementationFailed` (nothing registered).
    pub async fn clone_service(
        &self,
        artifact_id: &ArtifactId,
        service_id: &ServiceId,
    ) -> Result<ServiceId, ManagerError> {
        self.require(self.config.topology.clone, "clone")?;
        let artifact = self.registry().artifact(artifact_id)?;
        let _claim = artifact.claim()?;
        let source = self.registry().owned_service(&artifact, service_id)?;

        let spec = ServiceSpec::clone(&source.spec());
        let clone_id = ServiceId::new(format!("{service_id}~{}", self.next_sequence()));
        let config = ConfigMap::clone(&source.config());
        let logic = self.driver.instantiate_with(&clone_id, &spec, &config)?;
        let clone = Arc::new(self.driver.build_instance(
            clone_id.clone(),
            artifact_id,
            spec,
            config,
            logic,
        ));

        self.registry().insert_service(clone);
        artifact.push_service(clone_id.clone());
        let edges = artifact
            .wiring
            .lock()
            .duplicate_for(service_id, &clone_id);
        info!(
            service_id = %service_id,
            clone_id = %clone_id,
            edges,
            "service cloned"
        );
        Ok(clone_id)
    }

    /// Relocates a service to a fresh instance under a new identity. Edges
    /// are re-pointed to the new instance, configuration is carried over,
    /// buffered records are discarded. The old instance is stopped and
    /// removed; the new one resumes the old state.
    ///
    /// # Errors
    ///
    /// `NotSupported`, `ArtifactNotFound`, `ServiceNotFound`,
    /// `ConcurrencyConflict`, `InvalidStateTransition` for a STOPPED service,
    /// or `ImplementationFailed` if the relocated instance cannot be built
    /// (nothing changes) or fails to start (it then remains registered as
    /// AVAILABLE).
    pub async fn migrate(
        &self,
        artifact_id: &ArtifactId,
        service_id: &ServiceId,
    ) -> Result<ServiceId, ManagerError> {
        self.require(self.config.topology.migrate, "migrate")?;
        let artifact = self.registry().artifact(artifact_id)?;
        let sequence = self.next_sequence();
        let driver = self.driver.clone();
        let service = service_id.clone();
        detach(service_id, async move {
            driver.migrate(&artifact, &service, sequence).await
        })
        .await
    }

    /// Swaps the implementation of a service for another registered one with
    /// the same interface, keeping identity, configuration and channels.
    ///
    /// # Errors
    ///
    /// `NotSupported`, `ArtifactNotFound`, `ServiceNotFound`,
    /// `ConcurrencyConflict`, `InvalidStateTransition` for a STOPPED
    /// service, `Wiring(UnknownImplementation)`, or `ImplementationFailed`
    /// if the replacement cannot start (the previous implementation keeps
    /// running).
    pub async fn switch_to(
        &self,
        artifact_id: &ArtifactId,
        service_id: &ServiceId,
        implementation: &str,
    ) -> Result<(), ManagerError> {
        self.require(self.config.topology.switch, "switchTo")?;
        let artifact = self.registry().artifact(artifact_id)?;
        let _claim = artifact.claim()?;
        let instance = self.registry().owned_service(&artifact, service_id)?;

        let mut spec = ServiceSpec::clone(&instance.spec());
        spec.implementation = implementation.to_string();
        let driver = self.driver.clone();
        detach(service_id, async move { driver.swap(&instance, spec).await }).await?;
        info!(service_id = %service_id, implementation, "implementation switched");
        Ok(())
    }

    /// Re-resolves the artifact's locator and swaps in the implementation and
    /// version now declared for the service.
    ///
    /// # Errors
    ///
    /// As [`Self::switch_to`], plus `InvalidLocator`, `Wiring` for an invalid
    /// descriptor, a service no longer declared, or
    /// `IncompatibleInterface` if its ports changed.
    pub async fn update(
        &self,
        artifact_id: &ArtifactId,
        service_id: &ServiceId,
    ) -> Result<(), ManagerError> {
        self.require(self.config.topology.update, "update")?;
        let artifact = self.registry().artifact(artifact_id)?;
        let _claim = artifact.claim()?;
        let instance = self.registry().owned_service(&artifact, service_id)?;
        ensure_not_stopped(&instance)?;

        let descriptor = self.resolve(&artifact.locator).await?;
        let current = instance.spec();
        let fresh = descriptor
            .service(&current.id)
            .cloned()
            .ok_or_else(|| WiringError::UnknownService {
                service: current.id.clone(),
            })?;
        if !current.interface_matches(&fresh) {
            return Err(WiringError::IncompatibleInterface {
                service: current.id.clone(),
            }
            .into());
        }
        let version = fresh.version.clone();
        let driver = self.driver.clone();
        detach(service_id, async move { driver.swap(&instance, fresh).await }).await?;
        info!(
            service_id = %service_id,
            from = %current.version,
            to = %version,
            "service updated"
        );
        Ok(())
    }

    /// Removes every artifact, then delivers pending notifications for at
    /// most the teardown grace period.
    pub async fn shutdown(&self) {
        for id in self.get_artifact_ids() {
            if let Err(err) = self.remove_artifact(&id).await {
                warn!(artifact_id = %id, error = %err, "artifact not removed at shutdown");
            }
        }
        self.driver
            .notifier
            .shutdown(self.config.teardown_grace)
            .await;
        info!(node_id = %self.config.node_id, "service manager shut down");
    }

    /// Waits until every queued notification has been delivered. Later
    /// notifications are delivered inline.
    pub async fn flush_notifications(&self) {
        self.driver.notifier.drain().await;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn require(&self, enabled: bool, operation: &'static str) -> Result<(), ManagerError> {
        if enabled {
            Ok(())
        } else {
            debug!(operation, "topology operation disabled");
            Err(ManagerError::NotSupported { operation })
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn resolve(&self, url: &Url) -> Result<WiringDescriptor, ManagerError> {
        let descriptor =
            self.loader
                .resolve(url)
                .await
                .map_err(|err| ManagerError::InvalidLocator {
                    locator: url.to_string(),
                    reason: err.to_string(),
                })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn check_implementations(&self, descriptor: &WiringDescriptor) -> Result<(), ManagerError> {
        for spec in &descriptor.services {
            if !self.driver.catalog.contains(&spec.implementation) {
                return Err(WiringError::UnknownImplementation {
                    service: spec.id.clone(),
                    implementation: spec.implementation.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Retires the artifact's services producers first, one detached step
    /// per service.
    async fn retire_all(&self, artifact: &Arc<ArtifactEntry>) {
        let order = artifact
            .wiring
            .lock()
            .dependency_order(&artifact.services());
        for id in order {
            let Some(instance) = self.registry().find_service(&id) else {
                continue;
            };
            let driver = self.driver.clone();
            let owner = Arc::clone(artifact);
            let step = detach(&id, async move {
                driver.retire(&owner, &instance).await;
                Ok::<(), ManagerError>(())
            });
            if let Err(err) = step.await {
                warn!(service_id = %id, error = %err, "service not retired");
            }
        }
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("node_id", &self.config.node_id)
            .field("artifacts", &self.registry().artifacts().len())
            .finish_non_exhaustive()
    }
}

/// Runs `step` on a task of its own and waits for it. Dropping the returned
/// future abandons the wait; the step still runs to completion.
async fn detach<T>(
    service: &ServiceId,
    step: impl Future<Output = Result<T, ManagerError>> + Send + 'static,
) -> Result<T, ManagerError>
where
    T: Send + 'static,
{
    tokio::spawn(step).await.unwrap_or_else(|err| {
        Err(ManagerError::ImplementationFailed {
            service: service.clone(),
            reason: format!("transition task failed: {err}"),
        })
    })
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// The part of the manager that detached transitions carry with them.
#[derive(Clone)]
struct Driver {
    registry: Arc<ArtifactRegistry>,
    catalog: Arc<ImplementationCatalog>,
    notifier: Arc<Notifier>,
    channels: ChannelSettings,
    default_period: Duration,
}

impl Driver {
    async fn start(&self, instance: &ServiceInstance) -> Result<(), ManagerError> {
        let id = instance.id();
        let _control = instance.lock_control().await;
        let old = instance.state();
        let new = old
            .apply(Transition::Start)
            .map_err(|err| ManagerError::illegal(id, err))?;
        let artifact = self.registry.artifact(instance.artifact_id())?;

        instance
            .invoke_start()
            .await
            .map_err(|err| ManagerError::failed(id, &err))?;
        self.open_channels(&artifact, instance);
        instance.set_state(new);
        instance.launch();
        self.record_transition(id, old, new).await;
        Ok(())
    }

    async fn stop(&self, instance: &ServiceInstance) -> Result<(), ManagerError> {
        let _control = instance.lock_control().await;
        let old = instance.state();
        old.apply(Transition::Stop)
            .map_err(|err| ManagerError::illegal(instance.id(), err))?;
        let artifact = self.registry.artifact(instance.artifact_id())?;

        self.stop_locked(&artifact, instance, old).await;
        Ok(())
    }

    async fn passivate(&self, instance: &ServiceInstance) -> Result<(), ManagerError> {
        let id = instance.id();
        let _control = instance.lock_control().await;
        let old = instance.state();
        let new = old
            .apply(Transition::Passivate)
            .map_err(|err| ManagerError::illegal(id, err))?;

        instance
            .suspend()
            .await
            .map_err(|err| ManagerError::failed(id, &err))?;
        instance.set_state(new);
        self.record_transition(id, old, new).await;
        Ok(())
    }

    async fn activate(&self, instance: &ServiceInstance) -> Result<(), ManagerError> {
        let id = instance.id();
        let _control = instance.lock_control().await;
        let old = instance.state();
        let new = old
            .apply(Transition::Activate)
            .map_err(|err| ManagerError::illegal(id, err))?;

        instance
            .invoke_activate()
            .await
            .map_err(|err| ManagerError::failed(id, &err))?;
        instance.set_state(new);
        instance.launch();
        self.record_transition(id, old, new).await;
        Ok(())
    }

    /// Brings any service to STOPPED as part of artifact removal.
    async fn retire(&self, artifact: &ArtifactEntry, instance: &ServiceInstance) {
        let _control = instance.lock_control().await;
        match instance.state() {
            ServiceState::Stopped => {}
            ServiceState::Available => {
                instance.mark_retiring();
                artifact.wiring.lock().close_for(instance.id());
                instance.set_state(ServiceState::Stopped);
                self.record_transition(
                    instance.id(),
                    ServiceState::Available,
                    ServiceState::Stopped,
                )
                .await;
            }
            old => self.stop_locked(artifact, instance, old).await,
        }
    }

    /// Stop sequence; the caller holds the instance's control lock.
    async fn stop_locked(
        &self,
        artifact: &ArtifactEntry,
        instance: &ServiceInstance,
        old: ServiceState,
    ) {
        instance.mark_retiring();
        let closed = artifact.wiring.lock().close_for(instance.id());
        if let Err(err) = instance.halt().await {
            warn!(service_id = %instance.id(), error = %err, "stop hook failed");
        }
        instance.set_state(ServiceState::Stopped);
        debug!(service_id = %instance.id(), closed, "channels closed");
        self.record_transition(instance.id(), old, ServiceState::Stopped)
            .await;
    }

    async fn migrate(
        &self,
        artifact: &ArtifactEntry,
        service_id: &ServiceId,
        sequence: u64,
    ) -> Result<ServiceId, ManagerError> {
        let _claim = artifact.claim()?;
        let old = self.registry.owned_service(artifact, service_id)?;

        let old_control = old.lock_control().await;
        let old_state = old.state();
        if old_state.is_terminal() {
            return Err(ManagerError::InvalidStateTransition {
                service: service_id.clone(),
                attempted: ServiceState::Running,
                current: old_state,
            });
        }

        let spec = ServiceSpec::clone(&old.spec());
        let new_id = ServiceId::new(format!(
            "{}@{sequence}",
            ServiceId::scoped(&artifact.id, &spec.id)
        ));
        let config = ConfigMap::clone(&old.config());
        let logic = self.instantiate_with(&new_id, &spec, &config)?;
        let relocated = Arc::new(self.build_instance(
            new_id.clone(),
            &artifact.id,
            spec,
            config,
            logic,
        ));
        self.registry.insert_service(relocated.clone());
        artifact.replace_service(service_id, new_id.clone());

        old.mark_retiring();
        artifact
            .wiring
            .lock()
            .repoint(service_id, &new_id, |id| self.registry.find_service(id));
        if let Err(err) = old.halt().await {
            warn!(service_id = %service_id, error = %err, "migrated service failed to stop cleanly");
        }
        old.set_state(ServiceState::Stopped);
        self.record_transition(service_id, old_state, ServiceState::Stopped)
            .await;
        drop(old_control);
        self.registry.remove_service(service_id);
        info!(service_id = %service_id, new_id = %new_id, "service migrated");

        if old_state.holds_bindings() {
            self.resume_relocated(artifact, &relocated, old_state)
                .await?;
        }
        Ok(new_id)
    }

    async fn resume_relocated(
        &self,
        artifact: &ArtifactEntry,
        instance: &ServiceInstance,
        target: ServiceState,
    ) -> Result<(), ManagerError> {
        let id = instance.id();
        let _control = instance.lock_control().await;
        instance
            .invoke_start()
            .await
            .map_err(|err| ManagerError::failed(id, &err))?;
        self.open_channels(artifact, instance);
        instance.set_state(ServiceState::Running);
        instance.launch();
        self.record_transition(id, ServiceState::Available, ServiceState::Running)
            .await;

        if target == ServiceState::Passivated {
            instance
                .suspend()
                .await
                .map_err(|err| ManagerError::failed(id, &err))?;
            instance.set_state(ServiceState::Passivated);
            self.record_transition(id, ServiceState::Running, ServiceState::Passivated)
                .await;
        }
        Ok(())
    }

    /// Swaps in the implementation `spec` names, built from the service's
    /// current configuration.
    async fn swap(&self, instance: &ServiceInstance, spec: ServiceSpec) -> Result<(), ManagerError> {
        let id = instance.id();
        let _control = instance.lock_control().await;
        ensure_not_stopped(instance)?;
        let logic = self.instantiate_with(id, &spec, &instance.config())?;
        instance
            .swap_logic(logic, spec)
            .await
            .map_err(|err| ManagerError::failed(id, &err))
    }

    fn instantiate(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
    ) -> Result<Box<dyn ServiceLogic>, ManagerError> {
        match self.catalog.create(&spec.implementation, spec) {
            Some(Ok(logic)) => Ok(logic),
            Some(Err(err)) => Err(ManagerError::failed(id, &err)),
            None => Err(WiringError::UnknownImplementation {
                service: spec.id.clone(),
                implementation: spec.implementation.clone(),
            }
            .into()),
        }
    }

    /// Builds an implementation for `spec` that starts from `config` instead
    /// of the declared configuration.
    fn instantiate_with(
        &self,
        id: &ServiceId,
        spec: &ServiceSpec,
        config: &ConfigMap,
    ) -> Result<Box<dyn ServiceLogic>, ManagerError> {
        let effective = ServiceSpec {
            config: config.clone(),
            ..spec.clone()
        };
        self.instantiate(id, &effective)
    }

    fn build_instance(
        &self,
        id: ServiceId,
        artifact_id: &ArtifactId,
        spec: ServiceSpec,
        config: ConfigMap,
        logic: Box<dyn ServiceLogic>,
    ) -> ServiceInstance {
        ServiceInstance::new(
            id,
            artifact_id.clone(),
            spec,
            config,
            logic,
            &self.notifier,
            self.default_period,
        )
    }

    fn open_channels(&self, artifact: &ArtifactEntry, instance: &ServiceInstance) {
        let opened = artifact
            .wiring
            .lock()
            .open_for(instance.id(), self.channels, |id| self.registry.find_service(id));
        if opened > 0 {
            debug!(service_id = %instance.id(), opened, "channels opened");
        }
    }

    async fn record_transition(&self, id: &ServiceId, old: ServiceState, new: ServiceState) {
        metrics::counter!("flowyard_state_transitions_total", "to" => new.to_string())
            .increment(1);
        info!(service_id = %id, from = %old, to = %new, "service state changed");
        self.notifier
            .emit(LifecycleEvent::ServiceStateChanged {
                id: id.clone(),
                old,
                new,
            })
            .await;
    }
}

fn parse_locator(locator: &str) -> Result<Url, ManagerError> {
    if locator.trim().is_empty() {
        return Err(ManagerError::InvalidLocator {
            locator: locator.to_string(),
            reason: "empty locator".to_string(),
        });
    }
    Url::parse(locator).map_err(|err| ManagerError::InvalidLocator {
        locator: locator.to_string(),
        reason: err.to_string(),
    })
}

fn ensure_not_stopped(instance: &ServiceInstance) -> Result<(), ManagerError> {
    let current = instance.state();
    if current.is_terminal() {
        return Err(ManagerError::InvalidStateTransition {
            service: instance.id().clone(),
            attempted: ServiceState::Running,
            current,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use flowyard_core::{ManualClock, PortSpec, RelationSpec, ServiceKind};

    use super::*;
    use crate::config::{NotificationMode, TopologyOps};
    use crate::loader::MemoryLoader;
    use crate::notify::MemorySink;

    fn spec(id: &str, kind: ServiceKind, implementation: &str) -> ServiceSpec {
        let mut spec = ServiceSpec {
            id: id.into(),
            name: id.to_uppercase(),
            kind,
            version: "1.0.0".into(),
            description: String::new(),
            implementation: implementation.into(),
            inputs: vec![],
            outputs: vec![],
            config: ConfigMap::new(),
            period_ms: Some(10),
        };
        if kind.accepts_inputs() {
            spec.inputs.push(PortSpec::new("in", "Rec13"));
        }
        if kind.accepts_outputs() {
            spec.outputs.push(PortSpec::new("out", "Rec13"));
        }
        spec
    }

    fn demo() -> WiringDescriptor {
        WiringDescriptor {
            name: "demo".into(),
            services: vec![
                spec("s1", ServiceKind::Source, "counter-source"),
                spec("s2", ServiceKind::Sink, "logging-sink"),
            ],
            relations: vec![RelationSpec::new(("s1", "out"), ("s2", "in"))],
        }
    }

    fn manager(topology: TopologyOps) -> (ServiceManager, Arc<MemoryLoader>, Arc<MemorySink>) {
        let loader = Arc::new(MemoryLoader::new());
        let sink = Arc::new(MemorySink::new());
        let config = RuntimeConfig {
            notification_mode: NotificationMode::Sync,
            topology,
            ..RuntimeConfig::default()
        };
        let manager = ServiceManager::new(
            config,
            loader.clone(),
            Arc::new(ImplementationCatalog::with_builtins()),
            sink.clone(),
        )
        .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)));
        (manager, loader, sink)
    }

    #[tokio::test]
    async fn add_artifact_registers_available_services() {
        let (manager, loader, sink) = manager(TopologyOps::default());
        let locator = loader.publish("demo", demo());

        let id = manager.add_artifact(&locator).await.unwrap();

        let info = manager.get_artifact(&id).unwrap();
        assert_eq!(info.name, "demo");
        assert_eq!(info.created_at, 1_700_000_000_000);
        assert_eq!(info.services.len(), 2);
        for service in &info.services {
            assert_eq!(manager.get_state(service), Some(ServiceState::Available));
        }
        assert_eq!(sink.events(), vec![LifecycleEvent::ArtifactAdded { id }]);
    }

    #[tokio::test]
    async fn invalid_locators_register_nothing() {
        let (manager, _loader, _sink) = manager(TopologyOps::default());

        for locator in ["", "not a url", "mem://missing", "gopher://x"] {
            let err = manager.add_artifact(locator).await.unwrap_err();
            assert!(
                matches!(err, ManagerError::InvalidLocator { .. }),
                "{locator}: {err}"
            );
        }
        assert!(manager.get_artifact_ids().is_empty());
    }

    #[tokio::test]
    async fn type_mismatch_registers_nothing() {
        let (manager, loader, _sink) = manager(TopologyOps::default());
        let mut descriptor = demo();
        descriptor.services[1].inputs[0] = PortSpec::new("in", "Rec14");
        let locator = loader.publish("bad", descriptor);

        let err = manager.add_artifact(&locator).await.unwrap_err();

        assert!(matches!(
            err,
            ManagerError::Wiring(WiringError::TypeMismatch { .. })
        ));
        assert!(manager.get_artifact_ids().is_empty());
        assert!(manager.get_service_ids().is_empty());
    }

    #[tokio::test]
    async fn unknown_implementation_registers_nothing() {
        let (manager, loader, _sink) = manager(TopologyOps::default());
        let mut descriptor = demo();
        descriptor.services[1].implementation = "ghost".into();
        let locator = loader.publish("ghost", descriptor);

        let err = manager.add_artifact(&locator).await.unwrap_err();

        assert!(matches!(
            err,
            ManagerError::Wiring(WiringError::UnknownImplementation { .. })
        ));
        assert!(manager.get_service_ids().is_empty());
    }

    #[tokio::test]
    async fn validate_checks_without_registering() {
        let (manager, loader, sink) = manager(TopologyOps::default());
        let locator = loader.publish("demo", demo());

        let descriptor = manager.validate(&locator).await.unwrap();

        assert_eq!(descriptor.services.len(), 2);
        assert!(manager.get_artifact_ids().is_empty());
        assert!(sink.events().is_empty());
        assert!(matches!(
            manager.validate("mem://missing").await,
            Err(ManagerError::InvalidLocator { .. })
        ));
    }

    #[tokio::test]
    async fn lookups_on_unknown_ids_are_absent() {
        let (manager, _loader, _sink) = manager(TopologyOps::default());
        assert!(manager.get_artifact(&ArtifactId::new("nope")).is_none());
        assert!(manager.get_service(&ServiceId::new("nope/s1")).is_none());
        assert!(manager.get_state(&ServiceId::new("nope/s1")).is_none());
        assert!(matches!(
            manager.start_service(&ServiceId::new("nope/s1")).await,
            Err(ManagerError::ServiceNotFound(_))
        ));
        assert!(matches!(
            manager.remove_artifact(&ArtifactId::new("nope")).await,
            Err(ManagerError::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn disabled_topology_operations_are_not_supported() {
        let (manager, loader, _sink) = manager(TopologyOps::none());
        let id = manager
            .add_artifact(&loader.publish("demo", demo()))
            .await
            .unwrap();
        let s1 = ServiceId::scoped(&id, "s1");

        assert!(matches!(
            manager.clone_service(&id, &s1).await,
            Err(ManagerError::NotSupported { operation: "clone" })
        ));
        assert!(matches!(
            manager.migrate(&id, &s1).await,
            Err(ManagerError::NotSupported { operation: "migrate" })
        ));
        assert!(matches!(
            manager.switch_to(&id, &s1, "counter-source").await,
            Err(ManagerError::NotSupported { .. })
        ));
        assert!(matches!(
            manager.update(&id, &s1).await,
            Err(ManagerError::NotSupported { .. })
        ));
        assert_eq!(manager.get_artifact(&id).unwrap().services.len(), 2);
    }

    #[tokio::test]
    async fn set_state_maps_onto_transitions() {
        let (manager, loader, _sink) = manager(TopologyOps::default());
        let id = manager
            .add_artifact(&loader.publish("demo", demo()))
            .await
            .unwrap();
        let s2 = ServiceId::scoped(&id, "s2");

        manager.set_state(&s2, ServiceState::Running).await.unwrap();
        manager.set_state(&s2, ServiceState::Passivated).await.unwrap();
        manager.set_state(&s2, ServiceState::Running).await.unwrap();
        assert_eq!(manager.get_state(&s2), Some(ServiceState::Running));

        let err = manager
            .set_state(&s2, ServiceState::Available)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidStateTransition { .. }));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn artifact_start_and_stop_follow_dependencies() {
        let (manager, loader, sink) = manager(TopologyOps::default());
        let id = manager
            .add_artifact(&loader.publish("demo", demo()))
            .await
            .unwrap();
        let s1 = ServiceId::scoped(&id, "s1");
        let s2 = ServiceId::scoped(&id, "s2");

        manager.start_artifact(&id).await.unwrap();
        manager.stop_artifact(&id).await.unwrap();

        let order: Vec<(ServiceId, ServiceState)> = sink
            .events()
            .into_iter()
            .filter_map(|event| match event {
                LifecycleEvent::ServiceStateChanged { id, new, .. } => Some((id, new)),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec![
                (s2.clone(), ServiceState::Running),
                (s1.clone(), ServiceState::Running),
                (s1, ServiceState::Stopped),
                (s2, ServiceState::Stopped),
            ]
        );
    }
}
