//! Output ports and the handles services use to push records into them.
//!
//! Every declared output of a service is an [`OutputPort`]. The channels bound
//! to a port change while the service runs (a consumer starts, a clone is
//! wired in, a migrated peer is re-pointed), so the binding list is an
//! `ArcSwap` snapshot read lock-free on every emit.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use flowyard_core::{ChannelId, Record, ServiceId, TypeTag, Value};
use tracing::warn;

use crate::channel::RecordChannel;
use crate::error::ChannelError;
use crate::notify::{LifecycleEvent, Notifier};

/// A declared output and the channels currently bound to it.
pub struct OutputPort {
    service_id: ServiceId,
    name: String,
    type_tag: TypeTag,
    channels: ArcSwap<Vec<Arc<RecordChannel>>>,
    notifier: Arc<Notifier>,
}

impl OutputPort {
    pub(crate) fn new(
        service_id: ServiceId,
        name: String,
        type_tag: TypeTag,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            service_id,
            name,
            type_tag,
            channels: ArcSwap::from_pointee(Vec::new()),
            notifier,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    /// Number of channels bound to this output.
    #[must_use]
    pub fn fan_out(&self) -> usize {
        self.channels.load().len()
    }

    pub(crate) fn bind(&self, channel: Arc<RecordChannel>) {
        self.channels.rcu(|current| {
            let mut next = Vec::clone(current);
            if !next.iter().any(|c| c.id() == channel.id()) {
                next.push(channel.clone());
            }
            next
        });
    }

    pub(crate) fn unbind(&self, id: &ChannelId) {
        self.channels.rcu(|current| {
            current
                .iter()
                .filter(|c| c.id() != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Offers a record to every bound channel. An output with no bound
    /// channel accepts and discards the record.
    ///
    /// Channels are offered the record concurrently, so a blocked consumer
    /// delays the call by at most one enqueue timeout whatever the fan-out.
    ///
    /// # Errors
    ///
    /// Returns the first channel failure after all channels were tried.
    /// Backpressure drops are also reported to the notification sink.
    pub async fn emit(&self, payload: Value) -> Result<(), ChannelError> {
        let channels = self.channels.load_full();
        let outcomes = join_all(channels.iter().map(|channel| {
            let record = Record::new(self.type_tag.clone(), payload.clone());
            channel.enqueue(record)
        }))
        .await;

        let mut first_error = None;
        for err in outcomes.into_iter().filter_map(Result::err) {
            if let ChannelError::BackpressureDrop { channel } = &err {
                metrics::counter!("flowyard_backpressure_drops_total").increment(1);
                warn!(
                    service_id = %self.service_id,
                    channel = %channel,
                    "record dropped after enqueue timeout"
                );
                self.notifier
                    .emit(LifecycleEvent::BackpressureDrop {
                        channel: channel.clone(),
                    })
                    .await;
            }
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Cloneable handle pushing records into one output.
///
/// Obtained from [`crate::ServiceContext::ingestor`]; may be moved into tasks
/// owned by the service implementation.
#[derive(Clone)]
pub struct Ingestor {
    port: Arc<OutputPort>,
}

impl Ingestor {
    #[must_use]
    pub fn output(&self) -> &str {
        self.port.name()
    }

    #[must_use]
    pub fn type_tag(&self) -> &TypeTag {
        self.port.type_tag()
    }

    /// Emits one record carrying this output's type tag.
    ///
    /// # Errors
    ///
    /// See [`OutputPort::emit`].
    pub async fn ingest(&self, payload: impl Into<Value>) -> Result<(), ChannelError> {
        self.port.emit(payload.into()).await
    }
}

/// All outputs of a service, keyed by declared name.
#[derive(Clone, Default)]
pub struct Outputs {
    ports: Arc<HashMap<String, Arc<OutputPort>>>,
}

impl Outputs {
    pub(crate) fn new(ports: impl IntoIterator<Item = OutputPort>) -> Self {
        Self {
            ports: Arc::new(
                ports
                    .into_iter()
                    .map(|port| (port.name.clone(), Arc::new(port)))
                    .collect(),
            ),
        }
    }

    /// Returns the ingestor for a declared output.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Ingestor> {
        self.ports.get(name).map(|port| Ingestor { port: port.clone() })
    }

    /// Ingestors for every declared output.
    pub fn iter(&self) -> impl Iterator<Item = Ingestor> + '_ {
        self.ports.values().map(|port| Ingestor { port: port.clone() })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub(crate) fn port(&self, name: &str) -> Option<&Arc<OutputPort>> {
        self.ports.get(name)
    }

    pub(crate) fn ports(&self) -> impl Iterator<Item = &Arc<OutputPort>> {
        self.ports.values()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::NotificationMode;
    use crate::notify::MemorySink;

    fn channel_id(consumer: &str) -> ChannelId {
        ChannelId {
            producer: ServiceId::new("a/p"),
            output: "out".into(),
            consumer: ServiceId::new(consumer),
            input: "in".into(),
        }
    }

    fn port(sink: Arc<MemorySink>) -> OutputPort {
        OutputPort::new(
            ServiceId::new("a/p"),
            "out".into(),
            TypeTag::new("Rec13"),
            Arc::new(Notifier::new(sink, NotificationMode::Sync, 8)),
        )
    }

    #[tokio::test]
    async fn unwired_output_discards() {
        let port = port(Arc::new(MemorySink::new()));
        assert!(port.emit(Value::Int(1)).await.is_ok());
    }

    #[tokio::test]
    async fn fans_out_with_type_tag() {
        let port = port(Arc::new(MemorySink::new()));
        let c1 = Arc::new(RecordChannel::new(channel_id("a/c1"), 4, Duration::from_millis(10)));
        let c2 = Arc::new(RecordChannel::new(channel_id("a/c2"), 4, Duration::from_millis(10)));
        port.bind(c1.clone());
        port.bind(c2.clone());
        port.bind(c2.clone());
        assert_eq!(port.fan_out(), 2);

        port.emit(Value::Int(5)).await.unwrap();

        for ch in [&c1, &c2] {
            let record = ch.dequeue().await.unwrap();
            assert_eq!(record.type_tag, TypeTag::new("Rec13"));
            assert_eq!(record.payload, Value::Int(5));
        }
    }

    #[tokio::test]
    async fn drop_is_reported_to_sink_and_other_channels_still_receive() {
        let sink = Arc::new(MemorySink::new());
        let port = port(sink.clone());
        let full = Arc::new(RecordChannel::new(channel_id("a/c1"), 1, Duration::from_millis(5)));
        let open = Arc::new(RecordChannel::new(channel_id("a/c2"), 4, Duration::from_millis(5)));
        port.bind(full.clone());
        port.bind(open.clone());
        port.emit(Value::Int(1)).await.unwrap();

        let err = port.emit(Value::Int(2)).await.unwrap_err();

        assert_eq!(err.channel(), full.id());
        assert_eq!(open.len(), 2);
        assert_eq!(
            sink.events(),
            vec![LifecycleEvent::BackpressureDrop {
                channel: channel_id("a/c1")
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_fan_out_waits_one_enqueue_timeout() {
        let sink = Arc::new(MemorySink::new());
        let port = port(sink.clone());
        let timeout = Duration::from_millis(100);
        let channels: Vec<_> = ["a/c1", "a/c2", "a/c3"]
            .into_iter()
            .map(|c| Arc::new(RecordChannel::new(channel_id(c), 1, timeout)))
            .collect();
        for ch in &channels {
            port.bind(ch.clone());
        }
        port.emit(Value::Int(1)).await.unwrap();

        let began = tokio::time::Instant::now();
        assert!(port.emit(Value::Int(2)).await.is_err());
        let waited = began.elapsed();

        assert!(waited >= timeout);
        assert!(waited < timeout * 2, "waited {waited:?}");
        assert_eq!(sink.events().len(), 3);
        assert!(channels.iter().all(|ch| ch.len() == 1));
    }

    #[tokio::test]
    async fn unbind_removes_channel() {
        let port = port(Arc::new(MemorySink::new()));
        let ch = Arc::new(RecordChannel::new(channel_id("a/c1"), 4, Duration::from_millis(5)));
        port.bind(ch.clone());
        port.unbind(ch.id());

        port.emit(Value::Int(1)).await.unwrap();
        assert!(ch.is_empty());
    }

    #[tokio::test]
    async fn outputs_lookup_by_name() {
        let outputs = Outputs::new([port(Arc::new(MemorySink::new()))]);
        let ingestor = outputs.get("out").unwrap();
        assert_eq!(ingestor.output(), "out");
        assert_eq!(ingestor.type_tag().as_str(), "Rec13");
        assert!(outputs.get("missing").is_none());
        assert_eq!(outputs.iter().count(), 1);
    }
}
