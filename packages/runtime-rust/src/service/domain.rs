//! Domain services: each handles the operations of one `service_name` by
//! calling into the shared `ServiceManager`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;

use super::operation::{Operation, OperationError, OperationResponse};
use crate::manager::ServiceManager;

// ---------------------------------------------------------------------------
// Macro for the tower plumbing shared by all domains
// ---------------------------------------------------------------------------

/// Generates a domain service struct holding the manager, whose `call`
/// forwards to the domain's `handle` function.
macro_rules! domain_service {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            manager: Arc<ServiceManager>,
        }

        impl $name {
            #[must_use]
            pub fn new(manager: Arc<ServiceManager>) -> Self {
                Self { manager }
            }
        }

        impl Service<Operation> for $name {
            type Response = OperationResponse;
            type Error = OperationError;
            type Future =
                Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, op: Operation) -> Self::Future {
                let manager = self.manager.clone();
                Box::pin(async move { Self::handle(&manager, op).await })
            }
        }
    };
}

domain_service!(
    /// Artifact registration and lookups.
    RegistryDomain
);

domain_service!(
    /// Service and artifact state transitions.
    LifecycleDomain
);

domain_service!(
    /// Clone, migrate, switch and update.
    TopologyDomain
);

fn ack(op: &Operation) -> OperationResponse {
    OperationResponse::Ack {
        call_id: op.ctx().call_id,
    }
}

impl RegistryDomain {
    async fn handle(
        manager: &ServiceManager,
        op: Operation,
    ) -> Result<OperationResponse, OperationError> {
        let response = match &op {
            Operation::AddArtifact { locator, .. } => {
                OperationResponse::ArtifactId(manager.add_artifact(locator).await?)
            }
            Operation::RemoveArtifact { artifact, .. } => {
                manager.remove_artifact(artifact).await?;
                ack(&op)
            }
            Operation::GetArtifact { artifact, .. } => {
                OperationResponse::Artifact(manager.get_artifact(artifact))
            }
            Operation::GetArtifacts { .. } => OperationResponse::Artifacts(manager.get_artifacts()),
            Operation::GetArtifactIds { .. } => {
                OperationResponse::ArtifactIds(manager.get_artifact_ids())
            }
            Operation::GetService { service, .. } => {
                OperationResponse::Service(manager.get_service(service))
            }
            Operation::GetServices { .. } => OperationResponse::Services(manager.get_services()),
            Operation::GetServiceIds { .. } => {
                OperationResponse::ServiceIds(manager.get_service_ids())
            }
            Operation::GetState { service, .. } => {
                OperationResponse::State(manager.get_state(service))
            }
            other => {
                return Err(OperationError::WrongService {
                    operation: other.name(),
                })
            }
        };
        Ok(response)
    }
}

impl LifecycleDomain {
    async fn handle(
        manager: &ServiceManager,
        op: Operation,
    ) -> Result<OperationResponse, OperationError> {
        match &op {
            Operation::StartService { service, .. } => manager.start_service(service).await?,
            Operation::StopService { service, .. } => manager.stop_service(service).await?,
            Operation::Passivate { service, .. } => manager.passivate(service).await?,
            Operation::Activate { service, .. } => manager.activate(service).await?,
            Operation::Reconfigure {
                service, config, ..
            } => manager.reconfigure(service, config.clone()).await?,
            Operation::SetState { service, state, .. } => {
                manager.set_state(service, *state).await?;
            }
            Operation::StartArtifact { artifact, .. } => manager.start_artifact(artifact).await?,
            Operation::StopArtifact { artifact, .. } => manager.stop_artifact(artifact).await?,
            other => {
                return Err(OperationError::WrongService {
                    operation: other.name(),
                })
            }
        }
        Ok(ack(&op))
    }
}

impl TopologyDomain {
    async fn handle(
        manager: &ServiceManager,
        op: Operation,
    ) -> Result<OperationResponse, OperationError> {
        let response = match &op {
            Operation::Clone {
                artifact, service, ..
            } => OperationResponse::ServiceId(manager.clone_service(artifact, service).await?),
            Operation::Migrate {
                artifact, service, ..
            } => OperationResponse::ServiceId(manager.migrate(artifact, service).await?),
            Operation::SwitchTo {
                artifact,
                service,
                implementation,
                ..
            } => {
                manager.switch_to(artifact, service, implementation).await?;
                ack(&op)
            }
            Operation::Update {
                artifact, service, ..
            } => {
                manager.update(artifact, service).await?;
                ack(&op)
            }
            other => {
                return Err(OperationError::WrongService {
                    operation: other.name(),
                })
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::config::{NotificationMode, RuntimeConfig};
    use crate::loader::MemoryLoader;
    use crate::logic::ImplementationCatalog;
    use crate::notify::MemorySink;
    use crate::service::operation::{service_names, OperationContext};

    fn manager() -> Arc<ServiceManager> {
        Arc::new(ServiceManager::new(
            RuntimeConfig {
                notification_mode: NotificationMode::Sync,
                ..RuntimeConfig::default()
            },
            Arc::new(MemoryLoader::new()),
            Arc::new(ImplementationCatalog::with_builtins()),
            Arc::new(MemorySink::new()),
        ))
    }

    #[tokio::test]
    async fn registry_answers_lookups() {
        let domain = RegistryDomain::new(manager());
        let op = Operation::GetArtifactIds {
            ctx: OperationContext::new(1, service_names::REGISTRY, 0, 5000),
        };

        let resp = domain.oneshot(op).await.unwrap();
        assert_eq!(resp, OperationResponse::ArtifactIds(vec![]));
    }

    #[tokio::test]
    async fn domain_rejects_foreign_operations() {
        let domain = LifecycleDomain::new(manager());
        let op = Operation::GetArtifacts {
            ctx: OperationContext::new(1, service_names::LIFECYCLE, 0, 5000),
        };

        let err = domain.oneshot(op).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::WrongService {
                operation: "getArtifacts"
            }
        ));
    }

    #[tokio::test]
    async fn manager_errors_pass_through() {
        let domain = LifecycleDomain::new(manager());
        let op = Operation::StartService {
            ctx: OperationContext::new(1, service_names::LIFECYCLE, 0, 5000),
            service: flowyard_core::ServiceId::new("missing/s1"),
        };

        let err = domain.oneshot(op).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::Manager(crate::error::ManagerError::ServiceNotFound(_))
        ));
    }
}
