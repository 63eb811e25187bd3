//! Concurrency limit for dispatched operations.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};

use crate::service::operation::{CallerOrigin, Operation, OperationError, OperationResponse};

/// Caps in-flight operations at `max_concurrent`. Excess operations fail
/// fast with `OperationError::Overloaded` instead of queueing.
///
/// Operations issued by the runtime itself (`CallerOrigin::System`, e.g.
/// teardown at shutdown) bypass the limit.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> LoadShedService<S> {
    /// Permits still free for non-system callers.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// `Ok(None)` for exempt callers, `Err` when saturated.
    fn admit(&self, op: &Operation) -> Result<Option<OwnedSemaphorePermit>, OperationError> {
        if op.ctx().caller_origin == CallerOrigin::System {
            return Ok(None);
        }
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => {
                metrics::counter!("flowyard_operations_shed_total").increment(1);
                tracing::warn!(operation = op.name(), "operation shed, runtime overloaded");
                Err(OperationError::Overloaded)
            }
        }
    }
}

impl<S> Service<Operation> for LoadShedService<S>
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
        let permit = match self.admit(&op) {
            Ok(permit) => permit,
            Err(err) => return Box::pin(async move { Err(err) }),
        };
        let fut = self.inner.call(op);
        Box::pin(async move {
            let _permit = permit;
            fut.await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tower::ServiceExt;

    use super::*;
    use crate::service::middleware::test_support::{make_op, DelayedAck};

    #[tokio::test]
    async fn admits_under_limit() {
        let svc = LoadShedLayer::new(10).layer(DelayedAck { delay_ms: 1 });
        assert_eq!(svc.available(), 10);
        let resp = svc.oneshot(make_op(1, 1000)).await.unwrap();
        assert_eq!(resp, OperationResponse::Ack { call_id: 1 });
    }

    #[tokio::test]
    async fn sheds_when_saturated_and_recovers() {
        let mut svc = LoadShedLayer::new(1).layer(DelayedAck { delay_ms: 200 });

        let in_flight = tokio::spawn(svc.call(make_op(1, 1000)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(svc.available(), 0);

        let err = svc.call(make_op(2, 1000)).await.unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));

        in_flight.await.unwrap().unwrap();
        let resp = svc.call(make_op(3, 1000)).await.unwrap();
        assert_eq!(resp, OperationResponse::Ack { call_id: 3 });
    }

    #[tokio::test]
    async fn system_callers_bypass_the_limit() {
        let mut svc = LoadShedLayer::new(0).layer(DelayedAck { delay_ms: 0 });

        let mut op = make_op(5, 1000);
        assert!(matches!(
            svc.call(make_op(4, 1000)).await,
            Err(OperationError::Overloaded)
        ));
        if let Operation::GetArtifactIds { ctx } = &mut op {
            ctx.caller_origin = CallerOrigin::System;
        }
        let resp = svc.call(op).await.unwrap();
        assert_eq!(resp, OperationResponse::Ack { call_id: 5 });
    }
}
