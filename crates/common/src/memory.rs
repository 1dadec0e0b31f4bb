//! In-process queue with broker-like settlement semantics.
//!
//! Each [`MemoryConsumer`] behaves like its own AMQP channel: deliveries it
//! still holds when it closes go back to the queue, rejected-with-requeue
//! deliveries come back with `x-delivery-count` bumped the way a quorum queue
//! does, and a delivery tag can be settled exactly once. Used by the scheduler
//! and worker tests in place of RabbitMQ.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::QueueSource;
use crate::error::AppError;
use crate::types::{InboundDelivery, Settlement};

#[derive(Default)]
struct Inner {
    next_tag: u64,
    next_consumer: u64,
    pending: VecDeque<InboundDelivery>,
    in_flight: HashMap<u64, (u64, InboundDelivery)>,
    settled: Vec<(u64, Settlement)>,
    closed_consumers: usize,
    disconnected: bool,
}

impl Inner {
    fn enqueue(&mut self, delivery_count: Option<i64>, body: Vec<u8>) -> u64 {
        self.next_tag += 1;
        let tag = self.next_tag;
        self.pending
            .push_back(InboundDelivery::new(tag, delivery_count, body));
        tag
    }
}

/// Cloneable handle to a shared in-memory queue.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new consumer on this queue.
    pub fn consumer(&self) -> MemoryConsumer {
        let id = {
            let mut inner = self.lock();
            inner.next_consumer += 1;
            inner.next_consumer
        };
        MemoryConsumer {
            id,
            queue: self.clone(),
            closed: false,
        }
    }

    /// Enqueue a body as a first delivery. Returns its delivery tag.
    pub fn push(&self, body: impl Into<Vec<u8>>) -> u64 {
        self.push_with_count(body, None)
    }

    /// Enqueue a body carrying an explicit `x-delivery-count`.
    pub fn push_with_count(&self, body: impl Into<Vec<u8>>, delivery_count: Option<i64>) -> u64 {
        let tag = self.lock().enqueue(delivery_count, body.into());
        self.notify.notify_waiters();
        tag
    }

    /// Simulate the broker cancelling every consumer: `recv` returns `None` once drained.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
        self.notify.notify_waiters();
    }

    /// Every settlement in the order it was made.
    pub fn settlements(&self) -> Vec<(u64, Settlement)> {
        self.lock().settled.clone()
    }

    /// Messages waiting to be delivered.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Messages delivered to a consumer and not yet settled.
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Delivery counts of the waiting messages, front first.
    pub fn pending_delivery_counts(&self) -> Vec<Option<i64>> {
        self.lock()
            .pending
            .iter()
            .map(|d| d.metadata.delivery_count)
            .collect()
    }

    /// Number of consumers that have been closed.
    pub fn closed_consumers(&self) -> usize {
        self.lock().closed_consumers
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One consumer of a [`MemoryQueue`].
pub struct MemoryConsumer {
    id: u64,
    queue: MemoryQueue,
    closed: bool,
}

#[async_trait]
impl QueueSource for MemoryConsumer {
    async fn recv(&mut self) -> Result<Option<InboundDelivery>, AppError> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut inner = self.queue.lock();
                if self.closed {
                    return Ok(None);
                }
                if let Some(delivery) = inner.pending.pop_front() {
                    inner
                        .in_flight
                        .insert(delivery.delivery_tag(), (self.id, delivery.clone()));
                    return Ok(Some(delivery));
                }
                if inner.disconnected {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn settle(&mut self, delivery_tag: u64, settlement: Settlement) -> Result<(), AppError> {
        let requeued = {
            let mut inner = self.queue.lock();
            let owned = matches!(inner.in_flight.get(&delivery_tag), Some((owner, _)) if *owner == self.id);
            if !owned {
                return Err(AppError::Internal(format!(
                    "delivery tag {delivery_tag} is not held by this consumer"
                )));
            }
            let (_, delivery) = inner
                .in_flight
                .remove(&delivery_tag)
                .ok_or_else(|| AppError::Internal("delivery vanished".into()))?;
            inner.settled.push((delivery_tag, settlement));

            if settlement == (Settlement::Reject { requeue: true }) {
                let count = delivery.metadata.delivery_count.unwrap_or(0) + 1;
                inner.enqueue(Some(count), delivery.body);
                true
            } else {
                false
            }
        };
        if requeued {
            self.queue.notify.notify_waiters();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AppError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        {
            let mut inner = self.queue.lock();
            let held: Vec<u64> = inner
                .in_flight
                .iter()
                .filter(|(_, (owner, _))| *owner == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in held {
                if let Some((_, delivery)) = inner.in_flight.remove(&tag) {
                    // Released without a reject, so the delivery count is unchanged.
                    inner.pending.push_front(delivery);
                }
            }
            inner.closed_consumers += 1;
        }
        self.queue.notify.notify_waiters();
        Ok(())
    }
}
