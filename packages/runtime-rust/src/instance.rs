//! A deployed service: its implementation, state, configuration and the tasks
//! that move records through it while it runs.
//!
//! While RUNNING an instance owns one delivery pump per bound input channel
//! and, for sources, one production task. All of them share a cancellation
//! token and take the implementation lock around each callback, so after the
//! lock is held and the token cancelled no further callback can begin. A pump
//! holding a record it can no longer deliver puts it back at the head of its
//! channel; passivation therefore loses nothing and preserves order.
//!
//! Transition legality, channel wiring and notifications belong to the
//! manager. The methods here are the mechanical steps it sequences.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use flowyard_core::{ArtifactId, ChannelId, ConfigMap, ServiceId, ServiceKind, ServiceSpec, ServiceState};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::RecordChannel;
use crate::ingest::{OutputPort, Outputs};
use crate::logic::{ServiceContext, ServiceLogic};
use crate::notify::Notifier;
use crate::registry::ServiceInfo;

type SharedLogic = Arc<tokio::sync::Mutex<Box<dyn ServiceLogic>>>;

struct InputBinding {
    input: String,
    channel: Arc<RecordChannel>,
}

struct RunHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunHandle {
    async fn join(self, service: &ServiceId) {
        for result in join_all(self.tasks).await {
            if let Err(err) = result {
                warn!(service_id = %service, error = %err, "service task ended abnormally");
            }
        }
    }
}

#[derive(Default)]
struct Bindings {
    inputs: Vec<InputBinding>,
    active: Option<RunHandle>,
}

/// Runtime representation of one service of an artifact.
pub struct ServiceInstance {
    id: ServiceId,
    artifact_id: ArtifactId,
    spec: ArcSwap<ServiceSpec>,
    state: ArcSwap<ServiceState>,
    config: Arc<ArcSwap<ConfigMap>>,
    logic: SharedLogic,
    outputs: Outputs,
    bindings: Mutex<Bindings>,
    control: tokio::sync::Mutex<()>,
    retiring: AtomicBool,
    default_period: Duration,
}

impl ServiceInstance {
    pub(crate) fn new(
        id: ServiceId,
        artifact_id: ArtifactId,
        spec: ServiceSpec,
        config: ConfigMap,
        logic: Box<dyn ServiceLogic>,
        notifier: &Arc<Notifier>,
        default_period: Duration,
    ) -> Self {
        let outputs = Outputs::new(spec.outputs.iter().map(|port| {
            OutputPort::new(
                id.clone(),
                port.name.clone(),
                port.type_tag.clone(),
                notifier.clone(),
            )
        }));
        Self {
            id,
            artifact_id,
            spec: ArcSwap::from_pointee(spec),
            state: ArcSwap::from_pointee(ServiceState::Available),
            config: Arc::new(ArcSwap::from_pointee(config)),
            logic: Arc::new(tokio::sync::Mutex::new(logic)),
            outputs,
            bindings: Mutex::new(Bindings::default()),
            control: tokio::sync::Mutex::new(()),
            retiring: AtomicBool::new(false),
            default_period,
        }
    }

    #[must_use]
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    #[must_use]
    pub fn artifact_id(&self) -> &ArtifactId {
        &self.artifact_id
    }

    #[must_use]
    pub fn spec(&self) -> Arc<ServiceSpec> {
        self.spec.load_full()
    }

    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        self.spec.load().kind
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        **self.state.load()
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<ConfigMap> {
        self.config.load_full()
    }

    #[must_use]
    pub fn info(&self) -> ServiceInfo {
        let spec = self.spec();
        ServiceInfo {
            id: self.id.clone(),
            artifact_id: self.artifact_id.clone(),
            name: spec.name.clone(),
            kind: spec.kind,
            state: self.state(),
            version: spec.version.clone(),
            description: spec.description.clone(),
            implementation: spec.implementation.clone(),
            config: ConfigMap::clone(&self.config()),
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
        }
    }

    pub(crate) fn set_state(&self, state: ServiceState) {
        self.state.store(Arc::new(state));
    }

    /// Serializes transitions of this instance.
    pub(crate) async fn lock_control(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.control.lock().await
    }

    pub(crate) fn mark_retiring(&self) {
        self.retiring.store(true, Ordering::Release);
    }

    /// Stopped, or on its way there. No new channel may touch it.
    pub(crate) fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire) || self.state().is_terminal()
    }

    pub(crate) fn context(&self) -> ServiceContext {
        ServiceContext::new(
            self.id.clone(),
            self.artifact_id.clone(),
            self.config.clone(),
            self.outputs.clone(),
        )
    }

    pub(crate) fn output_port(&self, name: &str) -> Option<&Arc<OutputPort>> {
        self.outputs.port(name)
    }

    // -----------------------------------------------------------------------
    // Channel bindings
    // -----------------------------------------------------------------------

    /// Attaches an input channel. A running instance starts delivering from
    /// it immediately.
    pub(crate) fn bind_input(&self, input: &str, channel: Arc<RecordChannel>) {
        let mut bindings = self.bindings.lock();
        if bindings.inputs.iter().any(|b| b.channel.id() == channel.id()) {
            return;
        }
        let binding = InputBinding {
            input: input.to_string(),
            channel,
        };
        if let Some(active) = bindings.active.as_mut() {
            let pump = self.spawn_pump(&binding, &active.token);
            active.tasks.push(pump);
        }
        bindings.inputs.push(binding);
    }

    pub(crate) fn unbind_input(&self, id: &ChannelId) {
        self.bindings.lock().inputs.retain(|b| b.channel.id() != id);
    }

    pub(crate) fn unbind_outputs(&self, id: &ChannelId) {
        for port in self.outputs.ports() {
            port.unbind(id);
        }
    }

    /// Bound input channels, for inspection.
    #[must_use]
    pub fn input_channels(&self) -> Vec<Arc<RecordChannel>> {
        self.bindings
            .lock()
            .inputs
            .iter()
            .map(|b| b.channel.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Lifecycle steps
    // -----------------------------------------------------------------------

    pub(crate) async fn invoke_start(&self) -> anyhow::Result<()> {
        let ctx = self.context();
        self.logic.lock().await.start(&ctx).await
    }

    pub(crate) async fn invoke_activate(&self) -> anyhow::Result<()> {
        self.logic.lock().await.activate().await
    }

    /// Spawns the delivery pumps and, for sources, the production task.
    pub(crate) fn launch(&self) {
        let mut bindings = self.bindings.lock();
        if bindings.active.is_some() {
            return;
        }
        bindings.inputs.retain(|b| !b.channel.is_closed());

        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = bindings
            .inputs
            .iter()
            .map(|binding| self.spawn_pump(binding, &token))
            .collect();
        if self.kind() == ServiceKind::Source {
            tasks.push(self.spawn_producer(&token));
        }
        debug!(service_id = %self.id, tasks = tasks.len(), "service launched");
        bindings.active = Some(RunHandle { token, tasks });
    }

    /// Passivates the implementation and stops delivery. Records still
    /// buffered, or taken but not yet delivered, stay queued in order.
    pub(crate) async fn suspend(&self) -> anyhow::Result<()> {
        let mut logic = self.logic.lock().await;
        logic.passivate().await?;
        let run = self.bindings.lock().active.take();
        if let Some(run) = &run {
            run.token.cancel();
        }
        drop(logic);
        if let Some(run) = run {
            run.join(&self.id).await;
        }
        Ok(())
    }

    /// Stops every task, drops input bindings and calls the implementation's
    /// stop hook.
    pub(crate) async fn halt(&self) -> anyhow::Result<()> {
        let run = self.bindings.lock().active.take();
        if let Some(run) = run {
            run.token.cancel();
            run.join(&self.id).await;
        }
        self.bindings.lock().inputs.clear();
        self.logic.lock().await.stop().await
    }

    /// Lets the implementation validate `config`, then publishes it.
    pub(crate) async fn reconfigure(&self, config: ConfigMap) -> anyhow::Result<()> {
        let mut logic = self.logic.lock().await;
        logic.reconfigure(&config)?;
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Replaces the implementation at a point where no callback is running.
    ///
    /// If the instance is running or passivated, the replacement is started
    /// (and passivated to match) before the previous implementation is
    /// stopped. Fails without changes if the replacement cannot start.
    pub(crate) async fn swap_logic(
        &self,
        mut replacement: Box<dyn ServiceLogic>,
        spec: ServiceSpec,
    ) -> anyhow::Result<()> {
        let state = self.state();
        let mut logic = self.logic.lock().await;
        if state.holds_bindings() {
            replacement
                .start(&self.context())
                .await
                .context("replacement failed to start")?;
            if state == ServiceState::Passivated {
                replacement
                    .passivate()
                    .await
                    .context("replacement failed to passivate")?;
            }
        }
        let mut previous = std::mem::replace(&mut *logic, replacement);
        self.spec.store(Arc::new(spec));
        drop(logic);

        if state.holds_bindings() {
            if let Err(err) = previous.stop().await {
                warn!(service_id = %self.id, error = %err, "replaced implementation failed to stop");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    fn spawn_pump(&self, binding: &InputBinding, token: &CancellationToken) -> JoinHandle<()> {
        let service = self.id.clone();
        let input = binding.input.clone();
        let channel = binding.channel.clone();
        let logic = self.logic.clone();
        let outputs = self.outputs.clone();
        let token = token.clone();

        tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = channel.dequeue() => match next {
                        Some(record) => record,
                        None => break,
                    },
                };

                let mut logic = logic.lock().await;
                if token.is_cancelled() {
                    channel.requeue_front(record);
                    break;
                }
                metrics::counter!("flowyard_records_delivered_total").increment(1);
                if let Err(err) = logic.ingest(&input, record, &outputs).await {
                    warn!(service_id = %service, input = %input, error = %err, "record handling failed");
                }
            }
            debug!(service_id = %service, channel = %channel.id(), "delivery stopped");
        })
    }

    fn spawn_producer(&self, token: &CancellationToken) -> JoinHandle<()> {
        let period = self
            .spec
            .load()
            .period_ms
            .map_or(self.default_period, Duration::from_millis)
            .max(Duration::from_millis(1));
        let service = self.id.clone();
        let logic = self.logic.clone();
        let outputs = self.outputs.clone();
        let token = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mut logic = logic.lock().await;
                if token.is_cancelled() {
                    break;
                }
                if let Err(err) = logic.produce(&outputs).await {
                    warn!(service_id = %service, error = %err, "production tick failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
