//! Operation routing: dispatches `Operation` to domain services by `service_name`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;

use super::domain::{LifecycleDomain, RegistryDomain, TopologyDomain};
use super::operation::{service_names, Operation, OperationError, OperationResponse};
use crate::manager::ServiceManager;

type BoxedFuture = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

/// A boxed Tower service that handles operations for a single domain.
type BoxedService = Box<
    dyn Service<Operation, Response = OperationResponse, Error = OperationError, Future = BoxedFuture>
        + Send,
>;

// ---------------------------------------------------------------------------
// OperationRouter
// ---------------------------------------------------------------------------

/// Routes `Operation` values to the domain service registered under their
/// `service_name`. Unregistered names yield `OperationError::UnknownService`.
pub struct OperationRouter {
    services: HashMap<&'static str, BoxedService>,
}

impl OperationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Router with the registry, lifecycle and topology domains of `manager`.
    #[must_use]
    pub fn for_manager(manager: &Arc<ServiceManager>) -> Self {
        let mut router = Self::new();
        router.register(service_names::REGISTRY, RegistryDomain::new(manager.clone()));
        router.register(service_names::LIFECYCLE, LifecycleDomain::new(manager.clone()));
        router.register(service_names::TOPOLOGY, TopologyDomain::new(manager.clone()));
        router
    }

    /// Register a domain service for the given name.
    pub fn register<S>(&mut self, name: &'static str, service: S)
    where
        S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send + 'static,
        S::Future: Send + 'static,
    {
        self.services.insert(name, Box::new(ServiceWrapper(service)));
    }
}

impl Default for OperationRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Operation> for OperationRouter {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        for svc in self.services.values_mut() {
            match svc.poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let service_name = op.ctx().service_name;
        match self.services.get_mut(service_name) {
            Some(svc) => svc.call(op),
            None => Box::pin(async move {
                Err(OperationError::UnknownService {
                    name: service_name.to_string(),
                })
            }),
        }
    }
}

/// Type-erases a concrete `Service<Operation>` into a `BoxedService`.
struct ServiceWrapper<S>(S);

impl<S> Service<Operation> for ServiceWrapper<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        Box::pin(self.0.call(op))
    }
}
