//! Background worker for queued tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from a bounded
//! mpsc channel via a `BackgroundRunnable` implementation. Used for
//! asynchronous notification delivery.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called once when the queue has been drained. Default is a no-op.
    async fn shutdown(&mut self) {}
}

/// Why a task was not accepted by `try_submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("worker queue is full")]
    Full,
    #[error("worker is not running")]
    Stopped,
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an mpsc channel.
///
/// The worker spawns a tokio task that calls `BackgroundRunnable::run()` for
/// each queued task in order, then `BackgroundRunnable::shutdown()` once the
/// queue is closed and empty.
///
/// `drain()` lets queued tasks finish; `terminate()` abandons them.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable and queue
    /// capacity. Must be called from within a tokio runtime.
    pub fn start(mut runnable: R, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                runnable.run(task).await;
            }
            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Submit a task without waiting.
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Full` when the queue is at capacity and
    /// `SubmitError::Stopped` if the worker has been stopped.
    pub fn try_submit(&self, task: R::Task) -> Result<(), SubmitError> {
        match &self.tx {
            Some(tx) => tx.try_send(task).map_err(|err| match err {
                TrySendError::Full(_) => SubmitError::Full,
                TrySendError::Closed(_) => SubmitError::Stopped,
            }),
            None => Err(SubmitError::Stopped),
        }
    }

    /// Close the queue and wait until every queued task has been processed.
    pub async fn drain(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Like `drain`, but gives up after `grace` and terminates the worker.
    /// Returns `false` if tasks were abandoned.
    pub async fn drain_within(&mut self, grace: Duration) -> bool {
        self.tx.take();
        let Some(mut handle) = self.handle.take() else {
            return true;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_ok() {
            return true;
        }
        self.handle = Some(handle);
        self.terminate().await;
        false
    }

    /// Stop immediately, abandoning queued and in-flight tasks.
    pub async fn terminate(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
