//! Tower middleware layers for the operation pipeline.
//!
//! - [`timeout`]: Per-operation timeout enforcement
//! - [`metrics`]: Operation timing, counting and tracing spans
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::build_operation_pipeline;
pub use timeout::TimeoutLayer;

#[cfg(test)]
pub(crate) mod test_support {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tower::Service;

    use crate::service::operation::{
        service_names, Operation, OperationContext, OperationError, OperationResponse,
    };

    /// Acknowledges every operation after `delay_ms`.
    pub(crate) struct DelayedAck {
        pub delay_ms: u64,
    }

    impl Service<Operation> for DelayedAck {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, op: Operation) -> Self::Future {
            let delay = self.delay_ms;
            let call_id = op.ctx().call_id;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(OperationResponse::Ack { call_id })
            })
        }
    }

    pub(crate) fn make_op(call_id: u64, timeout_ms: u64) -> Operation {
        Operation::GetArtifactIds {
            ctx: OperationContext::new(call_id, service_names::REGISTRY, 0, timeout_ms),
        }
    }
}
