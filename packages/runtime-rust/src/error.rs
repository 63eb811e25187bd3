//! Error taxonomy of the service manager and record channels.

use flowyard_core::{ArtifactId, ChannelId, ServiceId, ServiceState, WiringError};

/// Outcome of a failed enqueue on a record channel.
///
/// Reported to the producing service; the producer decides whether to retry,
/// skip, or stop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The consuming side was stopped; the channel no longer accepts records.
    #[error("channel {channel} is closed")]
    ChannelClosed { channel: ChannelId },
    /// The channel stayed full past the enqueue timeout and the record was dropped.
    #[error("record dropped on full channel {channel}")]
    BackpressureDrop { channel: ChannelId },
}

impl ChannelError {
    #[must_use]
    pub fn channel(&self) -> &ChannelId {
        match self {
            ChannelError::ChannelClosed { channel } | ChannelError::BackpressureDrop { channel } => {
                channel
            }
        }
    }
}

/// Errors returned by `ServiceManager` operations.
///
/// Every failure crossing the manager boundary is one of these variants.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid locator '{locator}': {reason}")]
    InvalidLocator { locator: String, reason: String },
    #[error("wiring error: {0}")]
    Wiring(#[from] WiringError),
    #[error("artifact '{0}' not found")]
    ArtifactNotFound(ArtifactId),
    #[error("service '{0}' not found")]
    ServiceNotFound(ServiceId),
    #[error("service '{service}' cannot move from {current} to {attempted}")]
    InvalidStateTransition {
        service: ServiceId,
        attempted: ServiceState,
        current: ServiceState,
    },
    #[error("configuration rejected by '{service}': {reason}")]
    ConfigurationRejected { service: ServiceId, reason: String },
    #[error("artifact '{artifact}' did not stop within {grace_ms}ms")]
    TeardownTimeout { artifact: ArtifactId, grace_ms: u64 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("operation '{operation}' is not supported by this runtime")]
    NotSupported { operation: &'static str },
    #[error("another structural operation is in progress on '{target}'")]
    ConcurrencyConflict { target: String },
    #[error("implementation of '{service}' failed: {reason}")]
    ImplementationFailed { service: ServiceId, reason: String },
}

impl ManagerError {
    pub(crate) fn illegal(service: &ServiceId, err: flowyard_core::IllegalTransition) -> Self {
        ManagerError::InvalidStateTransition {
            service: service.clone(),
            attempted: err.attempted,
            current: err.current,
        }
    }

    pub(crate) fn failed(service: &ServiceId, err: &anyhow::Error) -> Self {
        ManagerError::ImplementationFailed {
            service: service.clone(),
            reason: format!("{err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_both_states() {
        let err = ManagerError::InvalidStateTransition {
            service: ServiceId::new("a/s1"),
            attempted: ServiceState::Running,
            current: ServiceState::Stopped,
        };
        assert_eq!(
            err.to_string(),
            "service 'a/s1' cannot move from STOPPED to RUNNING"
        );
    }

    #[test]
    fn channel_error_exposes_channel() {
        let channel = ChannelId {
            producer: ServiceId::new("p"),
            output: "out".into(),
            consumer: ServiceId::new("c"),
            input: "in".into(),
        };
        let err = ChannelError::BackpressureDrop {
            channel: channel.clone(),
        };
        assert_eq!(err.channel(), &channel);
        assert_eq!(err.to_string(), "record dropped on full channel p.out->c.in");
    }
}
