//! Lifecycle notifications for the external (digital twin) representation.
//!
//! The manager reports artifact and service lifecycle changes, plus channel
//! backpressure drops, through a [`Notifier`]. Depending on
//! [`NotificationMode`] the notifier either awaits the sink inline or hands
//! the event to a [`BackgroundWorker`]. A slow or failing sink never fails
//! the operation that produced the event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowyard_core::{ArtifactId, ChannelId, ServiceId, ServiceState};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::NotificationMode;
use crate::worker::{BackgroundRunnable, BackgroundWorker, SubmitError};

/// Events emitted by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    ArtifactAdded {
        id: ArtifactId,
    },
    ArtifactRemoved {
        id: ArtifactId,
    },
    ServiceStateChanged {
        id: ServiceId,
        old: ServiceState,
        new: ServiceState,
    },
    BackpressureDrop {
        channel: ChannelId,
    },
}

/// Receiver of lifecycle events.
///
/// Used as `Arc<dyn NotificationSink>`.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one event to the external representation.
    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

/// Sink that writes events to the `tracing` log.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match event {
            LifecycleEvent::BackpressureDrop { channel } => {
                warn!(channel = %channel, "backpressure drop");
            }
            other => info!(event = ?other, "lifecycle event"),
        }
        Ok(())
    }
}

/// Sink that keeps every event in memory, for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    /// Returns the state changes recorded for `service`, in order.
    #[must_use]
    pub fn transitions_of(&self, service: &ServiceId) -> Vec<(ServiceState, ServiceState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::ServiceStateChanged { id, old, new } if id == service => {
                    Some((*old, *new))
                }
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Composite sink that fans out to multiple sinks.
///
/// A failure of one sink does not prevent delivery to the others; the first
/// error is returned after all sinks have been tried.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl CompositeSink {
    /// Creates a composite sink with the given list of sinks.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// Adds a sink after construction.
    pub fn add(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl NotificationSink for CompositeSink {
    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(err) = sink.deliver(event).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

struct SinkRunnable {
    sink: Arc<dyn NotificationSink>,
}

#[async_trait]
impl BackgroundRunnable for SinkRunnable {
    type Task = LifecycleEvent;

    async fn run(&mut self, event: LifecycleEvent) {
        if let Err(err) = self.sink.deliver(&event).await {
            warn!(error = %err, event = ?event, "notification delivery failed");
        }
    }

    async fn shutdown(&mut self) {
        debug!("notification worker stopped");
    }
}

/// Routes events to the configured sink, inline or through a worker queue.
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    worker: Mutex<Option<BackgroundWorker<SinkRunnable>>>,
}

impl Notifier {
    /// Creates a notifier. `NotificationMode::Async` spawns the delivery
    /// worker and therefore must be called from within a tokio runtime.
    #[must_use]
    pub fn new(sink: Arc<dyn NotificationSink>, mode: NotificationMode, capacity: usize) -> Self {
        let worker = match mode {
            NotificationMode::Sync => None,
            NotificationMode::Async => Some(BackgroundWorker::start(
                SinkRunnable { sink: sink.clone() },
                capacity,
            )),
        };
        Self {
            sink,
            worker: Mutex::new(worker),
        }
    }

    /// Emits an event. In synchronous mode this returns once the sink has
    /// handled it; in asynchronous mode it only enqueues.
    pub async fn emit(&self, event: LifecycleEvent) {
        let queued = {
            let worker = self.worker.lock();
            worker.as_ref().map(|w| w.try_submit(event.clone()))
        };
        match queued {
            None | Some(Err(SubmitError::Stopped)) => {
                if let Err(err) = self.sink.deliver(&event).await {
                    warn!(error = %err, event = ?event, "notification delivery failed");
                }
            }
            Some(Ok(())) => {}
            Some(Err(SubmitError::Full)) => {
                metrics::counter!("flowyard_notifications_dropped_total").increment(1);
                warn!(event = ?event, "notification queue full, event dropped");
            }
        }
    }

    /// Delivers every queued event and stops the worker. Later events are
    /// delivered inline.
    pub async fn drain(&self) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.drain().await;
        }
    }

    /// Like `drain`, but abandons events still queued after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if !worker.drain_within(grace).await {
                let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
                warn!(grace_ms, "notification queue abandoned at shutdown");
            }
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("queued", &self.worker.lock().is_some())
            .finish_non_exhaustive()
    }
}
