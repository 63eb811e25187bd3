//! Pipeline composition: combines all middleware layers into a single service stack.

use std::future::Future;
use std::pin::Pin;

use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::config::RuntimeConfig;
use crate::service::operation::{Operation, OperationError, OperationResponse};
use crate::service::router::OperationRouter;

/// Build the operation pipeline by wrapping the `OperationRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded before doing any work
/// 2. `TimeoutLayer` -- enforce per-operation deadlines
/// 3. `MetricsLayer` -- record timing and outcome next to the handler
#[must_use]
pub fn build_operation_pipeline(
    router: OperationRouter,
    config: &RuntimeConfig,
) -> impl tower::Service<
    Operation,
    Response = OperationResponse,
    Error = OperationError,
    Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>,
> + Send {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_operations))
        .layer(TimeoutLayer::new(config.default_operation_timeout_ms))
        .layer(MetricsLayer)
        .service(router)
}
