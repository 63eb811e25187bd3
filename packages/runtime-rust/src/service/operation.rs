//! Operation types carried through the dispatch pipeline.

use flowyard_core::{ArtifactId, ConfigMap, ServiceId, ServiceState};
use serde::Serialize;

use crate::error::ManagerError;
use crate::registry::{ArtifactInfo, ServiceInfo};

/// Names of the domain services operations are routed to.
pub mod service_names {
    /// Artifact registration and lookups.
    pub const REGISTRY: &str = "registry";
    /// Per-service and per-artifact state transitions.
    pub const LIFECYCLE: &str = "lifecycle";
    /// Clone, migrate, switch and update.
    pub const TOPOLOGY: &str = "topology";
}

/// Origin of the operation caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerOrigin {
    /// In-process caller (CLI, embedding application, tests).
    Local,
    /// External dispatch layer.
    Remote,
    /// The runtime itself (e.g. shutdown).
    System,
}

/// Context carried with every operation through the pipeline.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub call_id: u64,
    pub service_name: &'static str,
    pub caller_origin: CallerOrigin,
    /// Milliseconds since epoch when the operation was classified.
    pub issued_at: u64,
    pub call_timeout_ms: u64,
}

impl OperationContext {
    #[must_use]
    pub fn new(call_id: u64, service_name: &'static str, issued_at: u64, call_timeout_ms: u64) -> Self {
        Self {
            call_id,
            service_name,
            caller_origin: CallerOrigin::Local,
            issued_at,
            call_timeout_ms,
        }
    }
}

/// Typed operation variants, one per manager operation.
#[derive(Debug)]
pub enum Operation {
    // ----- registry -----
    AddArtifact { ctx: OperationContext, locator: String },
    RemoveArtifact { ctx: OperationContext, artifact: ArtifactId },
    GetArtifact { ctx: OperationContext, artifact: ArtifactId },
    GetArtifacts { ctx: OperationContext },
    GetArtifactIds { ctx: OperationContext },
    GetService { ctx: OperationContext, service: ServiceId },
    GetServices { ctx: OperationContext },
    GetServiceIds { ctx: OperationContext },
    GetState { ctx: OperationContext, service: ServiceId },

    // ----- lifecycle -----
    StartService { ctx: OperationContext, service: ServiceId },
    StopService { ctx: OperationContext, service: ServiceId },
    Passivate { ctx: OperationContext, service: ServiceId },
    Activate { ctx: OperationContext, service: ServiceId },
    Reconfigure {
        ctx: OperationContext,
        service: ServiceId,
        config: ConfigMap,
    },
    SetState {
        ctx: OperationContext,
        service: ServiceId,
        state: ServiceState,
    },
    StartArtifact { ctx: OperationContext, artifact: ArtifactId },
    StopArtifact { ctx: OperationContext, artifact: ArtifactId },

    // ----- topology -----
    Clone {
        ctx: OperationContext,
        artifact: ArtifactId,
        service: ServiceId,
    },
    Migrate {
        ctx: OperationContext,
        artifact: ArtifactId,
        service: ServiceId,
    },
    SwitchTo {
        ctx: OperationContext,
        artifact: ArtifactId,
        service: ServiceId,
        implementation: String,
    },
    Update {
        ctx: OperationContext,
        artifact: ArtifactId,
        service: ServiceId,
    },
}

impl Operation {
    /// The context of this operation.
    #[must_use]
    pub fn ctx(&self) -> &OperationContext {
        match self {
            Operation::AddArtifact { ctx, .. }
            | Operation::RemoveArtifact { ctx, .. }
            | Operation::GetArtifact { ctx, .. }
            | Operation::GetArtifacts { ctx }
            | Operation::GetArtifactIds { ctx }
            | Operation::GetService { ctx, .. }
            | Operation::GetServices { ctx }
            | Operation::GetServiceIds { ctx }
            | Operation::GetState { ctx, .. }
            | Operation::StartService { ctx, .. }
            | Operation::StopService { ctx, .. }
            | Operation::Passivate { ctx, .. }
            | Operation::Activate { ctx, .. }
            | Operation::Reconfigure { ctx, .. }
            | Operation::SetState { ctx, .. }
            | Operation::StartArtifact { ctx, .. }
            | Operation::StopArtifact { ctx, .. }
            | Operation::Clone { ctx, .. }
            | Operation::Migrate { ctx, .. }
            | Operation::SwitchTo { ctx, .. }
            | Operation::Update { ctx, .. } => ctx,
        }
    }

    /// Remote name of the operation.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddArtifact { .. } => "addArtifact",
            Operation::RemoveArtifact { .. } => "removeArtifact",
            Operation::GetArtifact { .. } => "getArtifact",
            Operation::GetArtifacts { .. } => "getArtifacts",
            Operation::GetArtifactIds { .. } => "getArtifactIds",
            Operation::GetService { .. } => "getService",
            Operation::GetServices { .. } => "getServices",
            Operation::GetServiceIds { .. } => "getServiceIds",
            Operation::GetState { .. } => "getState",
            Operation::StartService { .. } => "startService",
            Operation::StopService { .. } => "stopService",
            Operation::Passivate { .. } => "passivate",
            Operation::Activate { .. } => "activate",
            Operation::Reconfigure { .. } => "reconfigure",
            Operation::SetState { .. } => "setState",
            Operation::StartArtifact { .. } => "startArtifact",
            Operation::StopArtifact { .. } => "stopArtifact",
            Operation::Clone { .. } => "clone",
            Operation::Migrate { .. } => "migrate",
            Operation::SwitchTo { .. } => "switchTo",
            Operation::Update { .. } => "update",
        }
    }
}

/// Successful response from an operation handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum OperationResponse {
    Ack { call_id: u64 },
    ArtifactId(ArtifactId),
    ServiceId(ServiceId),
    Artifact(Option<ArtifactInfo>),
    Artifacts(Vec<ArtifactInfo>),
    ArtifactIds(Vec<ArtifactId>),
    Service(Option<ServiceInfo>),
    Services(Vec<ServiceInfo>),
    ServiceIds(Vec<ServiceId>),
    State(Option<ServiceState>),
}

/// Errors returned by the operation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("unknown service: {name}")]
    UnknownService { name: String },
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("runtime overloaded, try again later")]
    Overloaded,
    #[error("wrong service for operation {operation}")]
    WrongService { operation: &'static str },
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Errors from classifying a named call into an `Operation`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("unknown operation: {name}")]
    UnknownOperation { name: String },
    #[error("invalid arguments for {operation}: {reason}")]
    InvalidArguments {
        operation: &'static str,
        reason: String,
    },
}
