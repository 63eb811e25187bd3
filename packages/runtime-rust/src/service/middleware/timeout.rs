//! Deadline enforcement for dispatched operations.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};

use crate::service::operation::{Operation, OperationError, OperationResponse};

/// Applies each operation's `call_timeout_ms`, or `default_ms` when the
/// caller left it at zero. Expiry yields `OperationError::Timeout`.
///
/// An expired manager operation is dropped at its next await point, which
/// releases the service and artifact locks it held.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    default_ms: u64,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default_ms: u64) -> Self {
        Self { default_ms }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default_ms: self.default_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default_ms: u64,
}

impl<S> TimeoutService<S> {
    fn deadline_of(&self, op: &Operation) -> u64 {
        match op.ctx().call_timeout_ms {
            0 => self.default_ms,
            ms => ms,
        }
    }
}

impl<S> Service<Operation> for TimeoutService<S>
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
        let timeout_ms = self.deadline_of(&op);
        let operation = op.name();
        let fut = self.inner.call(op);
        Box::pin(async move {
            tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
                .await
                .unwrap_or_else(|_| {
                    tracing::warn!(operation, timeout_ms, "operation deadline expired");
                    Err(OperationError::Timeout { timeout_ms })
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::test_support::{make_op, DelayedAck};

    #[tokio::test]
    async fn fast_operation_completes() {
        let svc = TimeoutLayer::new(1000).layer(DelayedAck { delay_ms: 1 });
        let resp = svc.oneshot(make_op(4, 1000)).await.unwrap();
        assert_eq!(resp, OperationResponse::Ack { call_id: 4 });
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out() {
        let svc = TimeoutLayer::new(1000).layer(DelayedAck { delay_ms: 5000 });
        let err = svc.oneshot(make_op(4, 50)).await.unwrap_err();
        assert!(matches!(err, OperationError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deadline_falls_back_to_default() {
        let svc = TimeoutLayer::new(200).layer(DelayedAck { delay_ms: 5000 });
        let err = svc.oneshot(make_op(4, 0)).await.unwrap_err();
        assert!(matches!(err, OperationError::Timeout { timeout_ms: 200 }));
    }
}
