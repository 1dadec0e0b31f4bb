//! Email worker: drains the `email` queue up to a fixed message budget.
//!
//! A worker moves `Running → Draining → Terminated` exactly once. It drains
//! when its budget is spent, when no message arrives within the inactivity
//! timeout, or when the broker closes the consumer. Each received message
//! counts against the budget; the first message past the budget is left
//! unsettled so the broker hands it to another worker once this one closes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::Instrument;
use uuid::Uuid;

use flood_common::broker::QueueSource;
use flood_common::error::AppError;
use flood_common::types::{InboundDelivery, NotificationMessage, Settlement};

use crate::retry::{self, FailureAction};
use crate::sender::{EmailNotification, NotificationSender};
use crate::severity;

/// Default wait for the next message before a worker gives up.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of messages a worker will process. Fixed at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerBudget {
    max_messages: u64,
}

impl WorkerBudget {
    pub fn new(max_messages: u64) -> Result<Self, AppError> {
        if max_messages == 0 {
            return Err(AppError::Validation(
                "max_messages must be a positive integer".into(),
            ));
        }
        Ok(Self { max_messages })
    }

    pub fn max_messages(&self) -> u64 {
        self.max_messages
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Draining,
    Terminated,
}

/// Why a worker stopped pulling messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    BudgetExhausted,
    Idle,
    SourceClosed,
}

/// Summary of one worker's lifetime.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: Uuid,
    pub budget: u64,
    /// Deliveries pulled from the queue, including an over-budget one left unsettled.
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub poisoned: u64,
    pub exit: WorkerExit,
    /// State the worker was in when the report was taken; `Terminated` once the consumer is released.
    pub final_state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkerReport {
    /// Deliveries this worker acked or rejected.
    pub fn settled(&self) -> u64 {
        self.acked + self.requeued + self.dead_lettered + self.poisoned
    }
}

struct Tally {
    received: u64,
    acked: u64,
    requeued: u64,
    dead_lettered: u64,
    poisoned: u64,
}

/// A single email worker owning its own queue consumer.
pub struct Worker<Q> {
    id: Uuid,
    budget: WorkerBudget,
    inactivity_timeout: Duration,
    source: Q,
    sender: Arc<dyn NotificationSender>,
    state: WorkerState,
    span: tracing::Span,
}

impl<Q: QueueSource> Worker<Q> {
    pub fn new(source: Q, sender: Arc<dyn NotificationSender>, budget: WorkerBudget) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            budget,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            source,
            sender,
            state: WorkerState::Running,
            span: tracing::info_span!("worker", worker_id = %id, budget = budget.max_messages),
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Replace the span every log line of this worker is recorded under.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Drain the queue until the budget or the inactivity timeout is reached,
    /// then release the consumer.
    pub async fn run(mut self) -> Result<WorkerReport, AppError> {
        let span = self.span.clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<WorkerReport, AppError> {
        let started_at = Utc::now();
        let mut tally = Tally {
            received: 0,
            acked: 0,
            requeued: 0,
            dead_lettered: 0,
            poisoned: 0,
        };

        tracing::info!("Worker started");

        let outcome = self.drain(&mut tally).await;

        self.transition(WorkerState::Draining);
        if let Err(e) = self.source.close().await {
            tracing::warn!(error = %e, "Failed to release queue connection cleanly");
        }
        self.transition(WorkerState::Terminated);

        let exit = outcome?;
        let report = WorkerReport {
            worker_id: self.id,
            budget: self.budget.max_messages,
            received: tally.received,
            acked: tally.acked,
            requeued: tally.requeued,
            dead_lettered: tally.dead_lettered,
            poisoned: tally.poisoned,
            exit,
            final_state: self.state,
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            exit = ?report.exit,
            received = report.received,
            acked = report.acked,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            poisoned = report.poisoned,
            "Worker terminated"
        );

        Ok(report)
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::debug!(from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }

    async fn drain(&mut self, tally: &mut Tally) -> Result<WorkerExit, AppError> {
        loop {
            let delivery =
                match tokio::time::timeout(self.inactivity_timeout, self.source.recv()).await {
                    Err(_) => {
                        tracing::info!(
                            timeout_ms = self.inactivity_timeout.as_millis() as u64,
                            "No message within inactivity timeout"
                        );
                        return Ok(WorkerExit::Idle);
                    }
                    Ok(Ok(Some(delivery))) => delivery,
                    Ok(Ok(None)) => {
                        tracing::warn!("Email queue consumer closed by broker");
                        return Ok(WorkerExit::SourceClosed);
                    }
                    Ok(Err(e)) => return Err(e),
                };

            tally.received += 1;
            if tally.received > self.budget.max_messages {
                tracing::debug!(
                    delivery_tag = delivery.delivery_tag(),
                    "Budget exhausted, leaving delivery for another worker"
                );
                return Ok(WorkerExit::BudgetExhausted);
            }

            self.process(delivery, tally).await?;
        }
    }

    /// Decode, classify, send and settle a single delivery.
    async fn process(
        &mut self,
        delivery: InboundDelivery,
        tally: &mut Tally,
    ) -> Result<(), AppError> {
        let tag = delivery.delivery_tag();

        let message = match NotificationMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    delivery_tag = tag,
                    error = %e,
                    "Poison message on email queue, rejecting without requeue"
                );
                self.source
                    .settle(tag, Settlement::Reject { requeue: false })
                    .await?;
                tally.poisoned += 1;
                return Ok(());
            }
        };

        let style = severity::classify(message.flood.severity_level);
        let notification = EmailNotification {
            subscriber_id: message.subscriber_id,
            email: message.subscriber_email,
            subject: style.subject.to_string(),
            flood_area_id: message.flood.flood_area_id,
            flood_description: message.flood.description,
            severity: message.flood.severity,
            message: message.flood.message,
            colour: style.colour.to_string(),
        };

        match self.sender.send(&notification).await {
            Ok(()) => {
                self.source.settle(tag, Settlement::Ack).await?;
                tally.acked += 1;
                tracing::info!(
                    subscriber_id = %notification.subscriber_id,
                    flood_area_id = %notification.flood_area_id,
                    "Notification sent"
                );
            }
            Err(e) => {
                let delivery_count = delivery.metadata.delivery_count;
                tracing::error!(
                    subscriber_id = %notification.subscriber_id,
                    email = %notification.email,
                    delivery_count = ?delivery_count,
                    error = %e,
                    "Email notification service failed"
                );

                let action = retry::on_failure(delivery_count);
                self.source.settle(tag, action.settlement()).await?;
                match action {
                    FailureAction::Requeue => tally.requeued += 1,
                    FailureAction::DeadLetter => {
                        tally.dead_lettered += 1;
                        tracing::error!(
                            subscriber_id = %notification.subscriber_id,
                            email = %notification.email,
                            delivery_count = ?delivery_count,
                            "Message retry limit reached, notification dead-lettered"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}
