//! Operation dispatch: classification, routing and the middleware pipeline.
//!
//! Named calls are classified into typed [`Operation`] values by
//! [`OperationService`], then sent through [`build_operation_pipeline`] to the
//! registry, lifecycle or topology domain service.

pub mod classify;
pub mod domain;
pub mod middleware;
pub mod operation;
pub mod router;

pub use classify::OperationService;
pub use domain::{LifecycleDomain, RegistryDomain, TopologyDomain};
pub use middleware::build_operation_pipeline;
pub use operation::{
    service_names, CallerOrigin, ClassifyError, Operation, OperationContext, OperationError,
    OperationResponse,
};
pub use router::OperationRouter;
