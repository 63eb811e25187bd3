//! Runtime configuration for the service manager and the operation pipeline.

use std::time::Duration;

/// How lifecycle events reach the notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    /// The calling operation waits until the sink has processed the event.
    Sync,
    /// Events are queued and delivered by a background worker.
    Async,
}

/// Switches for the topology-changing operations.
///
/// A disabled operation is rejected with `NotSupported` before it touches
/// the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct TopologyOps {
    pub clone: bool,
    pub migrate: bool,
    pub switch: bool,
    pub update: bool,
}

impl TopologyOps {
    /// All topology operations rejected.
    #[must_use]
    pub fn none() -> Self {
        Self {
            clone: false,
            migrate: false,
            switch: false,
            update: false,
        }
    }
}

impl Default for TopologyOps {
    fn default() -> Self {
        Self {
            clone: true,
            migrate: true,
            switch: true,
            update: true,
        }
    }
}

/// Runtime-level configuration.
///
/// Controls channel sizing and backpressure, teardown bounds, notification
/// delivery, and operation dispatch limits.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Identifier of this runtime node, reported in logs.
    pub node_id: String,
    /// Bounded capacity of every record channel.
    pub channel_capacity: usize,
    /// How long a producer waits on a full channel before the record is dropped.
    pub enqueue_timeout: Duration,
    /// How long `remove_artifact` waits for cascading stops to finish.
    pub teardown_grace: Duration,
    /// Production period for source services that declare none.
    pub default_source_period: Duration,
    /// Synchronous or queued notification delivery.
    pub notification_mode: NotificationMode,
    /// Queue depth for `NotificationMode::Async`.
    pub notification_queue_capacity: usize,
    /// Default timeout for dispatched operations in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent dispatched operations before load shedding.
    pub max_concurrent_operations: u32,
    /// Enabled topology-changing operations.
    pub topology: TopologyOps,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            channel_capacity: 32,
            enqueue_timeout: Duration::from_millis(100),
            teardown_grace: Duration::from_secs(5),
            default_source_period: Duration::from_secs(1),
            notification_mode: NotificationMode::Async,
            notification_queue_capacity: 256,
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            topology: TopologyOps::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.channel_capacity, 32);
        assert_eq!(config.enqueue_timeout, Duration::from_millis(100));
        assert_eq!(config.teardown_grace, Duration::from_secs(5));
        assert_eq!(config.notification_mode, NotificationMode::Async);
        assert_eq!(config.default_operation_timeout_ms, 30_000);
        assert_eq!(config.topology, TopologyOps::default());
    }

    #[test]
    fn topology_none_disables_everything() {
        let ops = TopologyOps::none();
        assert!(!ops.clone && !ops.migrate && !ops.switch && !ops.update);
    }
}
