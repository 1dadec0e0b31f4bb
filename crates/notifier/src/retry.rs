//! Delivery/retry policy for the `email` queue.
//!
//! Retry accounting lives entirely in the broker: quorum queues increment
//! `x-delivery-count` on every requeue, and the worker only reads it.

use flood_common::types::Settlement;

/// Deliveries at or beyond this count are dead-lettered instead of requeued.
pub const RETRY_THRESHOLD: i64 = 20;

/// What to do with a message after the delivery capability failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Put the message back on the queue for another attempt.
    Requeue,
    /// Drop it for good; the retry budget is spent.
    DeadLetter,
}

impl FailureAction {
    pub fn settlement(self) -> Settlement {
        match self {
            FailureAction::Requeue => Settlement::Reject { requeue: true },
            FailureAction::DeadLetter => Settlement::Reject { requeue: false },
        }
    }
}

/// Classify a failed delivery by its `x-delivery-count` header.
pub fn on_failure(delivery_count: Option<i64>) -> FailureAction {
    match delivery_count {
        None => FailureAction::Requeue,
        Some(count) if count < RETRY_THRESHOLD => FailureAction::Requeue,
        Some(_) => FailureAction::DeadLetter,
    }
}
