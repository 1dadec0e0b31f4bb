use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Queue carrying task-count messages from the front-end.
pub const TASKS_QUEUE: &str = "tasks";

/// Queue carrying one notification message per subscriber.
pub const EMAIL_QUEUE: &str = "email";

/// Broker header incremented on every requeue of a quorum-queue message.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Why a message body can never be processed. Every variant is a poison message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("no_of_tasks must be a positive number")]
    NoTasks,
}

/// Task-count message published by the front-end on the `tasks` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub no_of_tasks: u64,
}

/// Wire form of [`TaskMessage`]; the front-end may publish the count as a float.
#[derive(Deserialize)]
struct RawTaskMessage {
    no_of_tasks: serde_json::Number,
}

impl TaskMessage {
    /// Decode a `tasks` queue body. Missing, non-numeric or non-positive counts
    /// are rejected; fractional counts are rounded up.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawTaskMessage = serde_json::from_slice(body)?;
        let no_of_tasks = positive_count(&raw.no_of_tasks).ok_or(DecodeError::NoTasks)?;
        Ok(Self { no_of_tasks })
    }
}

fn positive_count(number: &serde_json::Number) -> Option<u64> {
    if let Some(count) = number.as_u64() {
        return (count > 0).then_some(count);
    }
    let count = number.as_f64()?;
    (count.is_finite() && count > 0.0).then(|| count.ceil() as u64)
}

/// Flood warning details as published by the alert pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flood {
    #[serde(rename = "floodAreaID")]
    pub flood_area_id: String,
    pub description: String,
    pub severity: String,
    #[serde(rename = "severityLevel")]
    pub severity_level: i64,
    pub message: String,
}

/// One queued notification for a single subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub flood: Flood,
    pub subscriber_id: String,
    pub subscriber_email: String,
}

impl NotificationMessage {
    /// Decode an `email` queue body. Absent or mistyped fields are rejected.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Broker envelope attached to every delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryMetadata {
    /// Opaque per-delivery identifier used for ack/reject.
    pub delivery_tag: u64,
    /// `x-delivery-count` header; absent on the first delivery.
    pub delivery_count: Option<i64>,
}

/// A single message pulled from a queue, not yet settled.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub metadata: DeliveryMetadata,
    pub body: Vec<u8>,
}

impl InboundDelivery {
    pub fn new(delivery_tag: u64, delivery_count: Option<i64>, body: Vec<u8>) -> Self {
        Self {
            metadata: DeliveryMetadata {
                delivery_tag,
                delivery_count,
            },
            body,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.metadata.delivery_tag
    }
}

/// How a delivery is settled with the broker. Exactly one per delivery tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject { requeue: bool },
}
