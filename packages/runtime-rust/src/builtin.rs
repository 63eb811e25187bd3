//! Built-in implementations available to every descriptor.
//!
//! - `counter-source`: emits `{"seq": n}` on each production tick, advancing
//!   by the `step` config value (default 1) from `start` (default 0).
//! - `passthrough`: forwards every record payload to all of its outputs.
//! - `logging-sink`: logs every record it receives.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use async_trait::async_trait;
use flowyard_core::{ConfigMap, Record, ServiceId, ServiceSpec, Value};
use tracing::{debug, info};

use crate::ingest::Outputs;
use crate::logic::{ImplementationCatalog, ServiceContext, ServiceLogic};

pub const COUNTER_SOURCE: &str = "counter-source";
pub const PASSTHROUGH: &str = "passthrough";
pub const LOGGING_SINK: &str = "logging-sink";

pub(crate) fn register_builtins(catalog: &ImplementationCatalog) {
    catalog.register(
        COUNTER_SOURCE,
        |spec: &ServiceSpec| -> anyhow::Result<Box<dyn ServiceLogic>> {
            Ok(Box::new(CounterSource::from_config(&spec.config)?))
        },
    );
    catalog.register(
        PASSTHROUGH,
        |_: &ServiceSpec| -> anyhow::Result<Box<dyn ServiceLogic>> { Ok(Box::new(Passthrough)) },
    );
    catalog.register(
        LOGGING_SINK,
        |_: &ServiceSpec| -> anyhow::Result<Box<dyn ServiceLogic>> {
            Ok(Box::new(LoggingSink::default()))
        },
    );
}

fn int_setting(config: &ConfigMap, key: &str, default: i64) -> anyhow::Result<i64> {
    match config.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_int()
            .with_context(|| format!("'{key}' must be an integer, got {value:?}")),
    }
}

// ---------------------------------------------------------------------------
// counter-source
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CounterSource {
    next: i64,
    step: i64,
}

impl CounterSource {
    /// # Errors
    ///
    /// Rejects a non-integer or non-positive `step` and a non-integer `start`.
    pub fn from_config(config: &ConfigMap) -> anyhow::Result<Self> {
        let step = Self::step_from(config)?;
        let next = int_setting(config, "start", 0)?;
        Ok(Self { next, step })
    }

    fn step_from(config: &ConfigMap) -> anyhow::Result<i64> {
        let step = int_setting(config, "step", 1)?;
        if step <= 0 {
            bail!("'step' must be positive, got {step}");
        }
        Ok(step)
    }
}

#[async_trait]
impl ServiceLogic for CounterSource {
    async fn produce(&mut self, outputs: &Outputs) -> anyhow::Result<()> {
        let payload = Value::Map(BTreeMap::from([("seq".to_string(), Value::Int(self.next))]));
        for output in outputs.iter() {
            if let Err(err) = output.ingest(payload.clone()).await {
                debug!(output = output.output(), error = %err, "counter record not delivered");
            }
        }
        self.next = self.next.saturating_add(self.step);
        Ok(())
    }

    fn reconfigure(&mut self, config: &ConfigMap) -> anyhow::Result<()> {
        self.step = Self::step_from(config)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// passthrough
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Passthrough;

#[async_trait]
impl ServiceLogic for Passthrough {
    async fn ingest(&mut self, _input: &str, record: Record, outputs: &Outputs) -> anyhow::Result<()> {
        for output in outputs.iter() {
            output.ingest(record.payload.clone()).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// logging-sink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LoggingSink {
    service_id: Option<ServiceId>,
    received: u64,
}

#[async_trait]
impl ServiceLogic for LoggingSink {
    async fn start(&mut self, ctx: &ServiceContext) -> anyhow::Result<()> {
        self.service_id = Some(ctx.service_id.clone());
        Ok(())
    }

    async fn ingest(&mut self, input: &str, record: Record, _outputs: &Outputs) -> anyhow::Result<()> {
        self.received += 1;
        info!(
            service_id = ?self.service_id,
            input,
            type_tag = %record.type_tag,
            payload = ?record.payload,
            "record received"
        );
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        info!(service_id = ?self.service_id, received = self.received, "sink stopped");
        Ok(())
    }
}
