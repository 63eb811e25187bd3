//! Metrics middleware for operations.
//!
//! Records operation duration and outcome in a `tracing` span and bumps the
//! `flowyard_operations_total` counter, labelled by operation and outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments operations with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

fn outcome_of(result: &Result<OperationResponse, OperationError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(OperationError::Timeout { .. }) => "timeout",
        Err(OperationError::Overloaded) => "overloaded",
        Err(_) => "error",
    }
}

impl<S> Service<Operation> for MetricsService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let service_name = op.ctx().service_name;
        let call_id = op.ctx().call_id;
        let operation = op.name();

        let span = info_span!(
            "operation",
            service = service_name,
            operation = operation,
            call_id = call_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(op);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = outcome_of(&result);

                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                metrics::counter!(
                    "flowyard_operations_total",
                    "operation" => operation,
                    "outcome" => outcome
                )
                .increment(1);

                match &result {
                    Err(err) => tracing::info!(
                        call_id,
                        duration_ms,
                        outcome,
                        error = %err,
                        "operation complete"
                    ),
                    Ok(_) => tracing::info!(call_id, duration_ms, outcome, "operation complete"),
                }

                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::error::ManagerError;
    use crate::service::middleware::test_support::{make_op, DelayedAck};

    #[tokio::test]
    async fn passes_through_response() {
        let svc = MetricsLayer.layer(DelayedAck { delay_ms: 0 });
        let resp = svc.oneshot(make_op(42, 5000)).await.unwrap();
        assert_eq!(resp, OperationResponse::Ack { call_id: 42 });
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_of(&Ok(OperationResponse::Ack { call_id: 1 })), "ok");
        assert_eq!(
            outcome_of(&Err(OperationError::Timeout { timeout_ms: 5 })),
            "timeout"
        );
        assert_eq!(outcome_of(&Err(OperationError::Overloaded)), "overloaded");
        assert_eq!(
            outcome_of(&Err(OperationError::Manager(ManagerError::NotSupported {
                operation: "clone"
            }))),
            "error"
        );
    }
}
