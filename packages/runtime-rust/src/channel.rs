//! Bounded FIFO record channel between one producer output and one consumer
//! input.
//!
//! The buffer lives behind a short `parking_lot` lock; waiting happens on two
//! `Notify` handles so neither side holds the lock across an await. A producer
//! facing a full buffer waits up to the configured enqueue timeout and then
//! gives up with [`ChannelError::BackpressureDrop`]. Closing discards the
//! buffer and wakes both sides.

use std::collections::VecDeque;
use std::time::Duration;

use flowyard_core::{ChannelId, Record};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::ChannelError;

struct Buffer {
    records: VecDeque<Record>,
    closed: bool,
}

/// A typed, bounded channel. Shared as `Arc<RecordChannel>` between the
/// producer's output port and the consumer's delivery pump.
pub struct RecordChannel {
    id: ChannelId,
    capacity: usize,
    enqueue_timeout: Duration,
    buffer: Mutex<Buffer>,
    not_empty: Notify,
    not_full: Notify,
}

impl RecordChannel {
    /// Creates an open, empty channel. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(id: ChannelId, capacity: usize, enqueue_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            capacity,
            enqueue_timeout,
            buffer: Mutex::new(Buffer {
                records: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.buffer.lock().closed
    }

    /// Appends a record, waiting for space up to the enqueue timeout.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` if the channel is (or becomes) closed while waiting,
    /// `BackpressureDrop` if no space frees up before the timeout. In both
    /// cases the record is discarded.
    pub async fn enqueue(&self, record: Record) -> Result<(), ChannelError> {
        let deadline = Instant::now() + self.enqueue_timeout;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut buffer = self.buffer.lock();
                if buffer.closed {
                    return Err(ChannelError::ChannelClosed {
                        channel: self.id.clone(),
                    });
                }
                if buffer.records.len() < self.capacity {
                    buffer.records.push_back(record);
                    drop(buffer);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ChannelError::BackpressureDrop {
                    channel: self.id.clone(),
                });
            }
        }
    }

    /// Removes the oldest record, waiting until one is available.
    ///
    /// Returns `None` once the channel is closed. Cancel safe: a record is
    /// only taken from the buffer in the poll that returns it.
    pub async fn dequeue(&self) -> Option<Record> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut buffer = self.buffer.lock();
                if buffer.closed {
                    return None;
                }
                if let Some(record) = buffer.records.pop_front() {
                    drop(buffer);
                    self.not_full.notify_one();
                    return Some(record);
                }
            }

            notified.await;
        }
    }

    /// Puts back a record taken by `dequeue` that could not be delivered, so
    /// it is the next one out. Ignored on a closed channel.
    ///
    /// May briefly leave the buffer one record over capacity if a producer
    /// filled the freed slot in between.
    pub fn requeue_front(&self, record: Record) {
        let mut buffer = self.buffer.lock();
        if buffer.closed {
            return;
        }
        buffer.records.push_front(record);
        drop(buffer);
        self.not_empty.notify_one();
    }

    /// Closes the channel: discards buffered records and fails every pending
    /// and future enqueue. Returns the number of records discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut buffer = self.buffer.lock();
            if buffer.closed {
                return 0;
            }
            buffer.closed = true;
            let discarded = buffer.records.len();
            buffer.records.clear();
            discarded
        };
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        tracing::debug!(channel = %self.id, discarded, "channel closed");
        discarded
    }
}

impl std::fmt::Debug for RecordChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordChannel")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
