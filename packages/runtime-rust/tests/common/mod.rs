//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowyard_core::{
    ArtifactId, ConfigMap, PortSpec, Record, RelationSpec, ServiceId, ServiceKind, ServiceSpec,
    Value, WiringDescriptor,
};
use flowyard_runtime::{
    ImplementationCatalog, MemoryLoader, MemorySink, NotificationMode, Outputs, RuntimeConfig,
    ServiceContext, ServiceLogic, ServiceManager,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Source that never produces on its own; tests push through its ingestor.
pub const MANUAL_SOURCE: &str = "manual-source";
/// Sink or transform that records every payload and forwards it to all outputs.
pub const RECORDER: &str = "recorder";

pub const REC13: &str = "Rec13";

/// Payloads received per running service, keyed by runtime id.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<HashMap<ServiceId, Vec<Value>>>>);

impl Received {
    pub fn of(&self, id: &ServiceId) -> Vec<Value> {
        self.0.lock().get(id).cloned().unwrap_or_default()
    }

    pub fn count(&self, id: &ServiceId) -> usize {
        self.0.lock().get(id).map_or(0, Vec::len)
    }

    fn push(&self, id: &ServiceId, payload: Value) {
        self.0.lock().entry(id.clone()).or_default().push(payload);
    }
}

struct ManualSource;

impl ServiceLogic for ManualSource {}

/// Config keys: `reject` (any value) rejects reconfiguration,
/// `stop_delay_ms` delays the stop hook.
struct Recorder {
    received: Received,
    stopping: Arc<Notify>,
    id: Option<ServiceId>,
    stop_delay: Duration,
}

#[async_trait]
impl ServiceLogic for Recorder {
    async fn start(&mut self, ctx: &ServiceContext) -> anyhow::Result<()> {
        self.id = Some(ctx.service_id.clone());
        Ok(())
    }

    async fn ingest(&mut self, _input: &str, record: Record, outputs: &Outputs) -> anyhow::Result<()> {
        if let Some(id) = &self.id {
            self.received.push(id, record.payload.clone());
        }
        for output in outputs.iter() {
            output.ingest(record.payload.clone()).await?;
        }
        Ok(())
    }

    fn reconfigure(&mut self, config: &ConfigMap) -> anyhow::Result<()> {
        if config.contains_key("reject") {
            anyhow::bail!("configuration marked for rejection");
        }
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.stopping.notify_one();
        tokio::time::sleep(self.stop_delay).await;
        Ok(())
    }
}

pub struct Harness {
    pub manager: Arc<ServiceManager>,
    pub loader: Arc<MemoryLoader>,
    pub events: Arc<MemorySink>,
    pub received: Received,
    /// Signalled when a recorder's stop hook begins.
    pub stopping: Arc<Notify>,
}

impl Harness {
    /// Harness with synchronous notifications, so events are visible as soon
    /// as the operation returns.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig {
            notification_mode: NotificationMode::Sync,
            ..RuntimeConfig::default()
        })
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let received = Received::default();
        let catalog = ImplementationCatalog::with_builtins();
        catalog.register(
            MANUAL_SOURCE,
            |_: &ServiceSpec| -> anyhow::Result<Box<dyn ServiceLogic>> { Ok(Box::new(ManualSource)) },
        );
        let stopping = Arc::new(Notify::new());
        let store = received.clone();
        let stop_signal = stopping.clone();
        catalog.register(
            RECORDER,
            move |spec: &ServiceSpec| -> anyhow::Result<Box<dyn ServiceLogic>> {
                let stop_delay = spec
                    .config
                    .get("stop_delay_ms")
                    .and_then(Value::as_int)
                    .map_or(Duration::ZERO, |ms| Duration::from_millis(ms.unsigned_abs()));
                Ok(Box::new(Recorder {
                    received: store.clone(),
                    stopping: stop_signal.clone(),
                    id: None,
                    stop_delay,
                }))
            },
        );

        let loader = Arc::new(MemoryLoader::new());
        let events = Arc::new(MemorySink::new());
        let manager = Arc::new(ServiceManager::new(
            config,
            loader.clone(),
            Arc::new(catalog),
            events.clone(),
        ));
        Self {
            manager,
            loader,
            events,
            received,
            stopping,
        }
    }

    pub async fn deploy(&self, name: &str, descriptor: WiringDescriptor) -> ArtifactId {
        let locator = self.loader.publish(name, descriptor);
        self.manager
            .add_artifact(&locator)
            .await
            .expect("artifact should load")
    }
}

/// Declares a service with an `in` input (unless a source) and an `out`
/// output (unless a sink), both of type `Rec13`.
pub fn service(id: &str, kind: ServiceKind, implementation: &str) -> ServiceSpec {
    let mut spec = ServiceSpec {
        id: id.into(),
        name: id.to_uppercase(),
        kind,
        version: "1.0.0".into(),
        description: format!("{id} under test"),
        implementation: implementation.into(),
        inputs: vec![],
        outputs: vec![],
        config: ConfigMap::new(),
        period_ms: Some(10),
    };
    if kind.accepts_inputs() {
        spec.inputs.push(PortSpec::new("in", REC13));
    }
    if kind.accepts_outputs() {
        spec.outputs.push(PortSpec::new("out", REC13));
    }
    spec
}

/// `src` (manual source) -> `snk` (recorder).
pub fn source_to_sink() -> WiringDescriptor {
    WiringDescriptor {
        name: "source-to-sink".into(),
        services: vec![
            service("src", ServiceKind::Source, MANUAL_SOURCE),
            service("snk", ServiceKind::Sink, RECORDER),
        ],
        relations: vec![RelationSpec::new(("src", "out"), ("snk", "in"))],
    }
}

/// `src` (manual source) -> `mid` (recorder transform) -> `snk` (recorder).
pub fn three_stage() -> WiringDescriptor {
    WiringDescriptor {
        name: "three-stage".into(),
        services: vec![
            service("src", ServiceKind::Source, MANUAL_SOURCE),
            service("mid", ServiceKind::Transform, RECORDER),
            service("snk", ServiceKind::Sink, RECORDER),
        ],
        relations: vec![
            RelationSpec::new(("src", "out"), ("mid", "in")),
            RelationSpec::new(("mid", "out"), ("snk", "in")),
        ],
    }
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn seq(n: i64) -> Value {
    Value::Map([("seq".to_string(), Value::Int(n))].into_iter().collect())
}
