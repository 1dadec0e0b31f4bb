//! Task scheduler: turns task-count messages into sized worker batches.
//!
//! For every message on the `tasks` queue:
//! 1. Decode `no_of_tasks` (poison messages are rejected without requeue)
//! 2. Size the batch: one worker per `MAX_TASKS_PER_QUEUE` tasks, capped at the core count
//! 3. Acknowledge the task message
//! 4. Hand `(worker_count, tasks_per_worker)` to the launcher

use tracing::Instrument;

use flood_common::broker::QueueSource;
use flood_common::error::AppError;
use flood_common::types::{InboundDelivery, Settlement, TaskMessage};
use flood_notifier::worker::WorkerBudget;

use crate::launcher::{LaunchSummary, WorkerLauncher};

/// Tasks a single worker is sized for before another worker is added.
pub const MAX_TASKS_PER_QUEUE: u64 = 100;

/// Worker batch for one task message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadPlan {
    pub worker_count: u64,
    pub tasks_per_worker: u64,
}

/// Size a batch of workers for `no_of_tasks` pending notifications.
///
/// The last worker may be handed slightly less work than `tasks_per_worker`;
/// the product can exceed `no_of_tasks` but never falls short of it.
pub fn plan_workload(no_of_tasks: u64, core_count: usize) -> WorkloadPlan {
    let no_of_tasks = no_of_tasks.max(1);
    let cores = (core_count as u64).max(1);

    let worker_count = no_of_tasks.div_ceil(MAX_TASKS_PER_QUEUE).min(cores);
    let tasks_per_worker = no_of_tasks.div_ceil(worker_count);

    WorkloadPlan {
        worker_count,
        tasks_per_worker,
    }
}

/// Processing cores available to this process.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// What happened to one task message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Dispatched {
        plan: WorkloadPlan,
        launch: LaunchSummary,
    },
    /// Undecodable; rejected without requeue and no workers spawned.
    Rejected,
}

/// Consumes the `tasks` queue and dispatches worker batches.
pub struct TaskScheduler<Q, L> {
    source: Q,
    launcher: L,
    core_count: usize,
    span: tracing::Span,
}

impl<Q: QueueSource, L: WorkerLauncher> TaskScheduler<Q, L> {
    pub fn new(source: Q, launcher: L) -> Self {
        Self {
            source,
            launcher,
            core_count: available_cores(),
            span: tracing::info_span!("scheduler"),
        }
    }

    /// Override the detected core count used to cap batch sizes.
    pub fn with_core_count(mut self, core_count: usize) -> Self {
        self.core_count = core_count.max(1);
        self
    }

    /// Replace the span every log line of the scheduler is recorded under.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Take back the launcher, e.g. to wait for spawned workers after shutdown.
    pub fn into_launcher(self) -> L {
        self.launcher
    }

    /// Consume task messages until the broker closes the consumer.
    ///
    /// Cancelling this future (e.g. on Ctrl+C) stops consumption; call
    /// [`TaskScheduler::shutdown`] afterwards to release the connection.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let span = self.span.clone();
        self.consume().instrument(span).await
    }

    async fn consume(&mut self) -> anyhow::Result<()> {
        tracing::info!(core_count = self.core_count, "Task scheduler consuming");

        while let Some(delivery) = self.source.recv().await? {
            self.handle(delivery).await?;
        }

        tracing::warn!("Tasks queue consumer closed by broker");
        Ok(())
    }

    /// Process a single task message.
    pub async fn handle(&mut self, delivery: InboundDelivery) -> anyhow::Result<TaskOutcome> {
        let tag = delivery.delivery_tag();

        let task = match TaskMessage::decode(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(
                    delivery_tag = tag,
                    error = %e,
                    "Could not decode task message, rejecting as subsequent attempts will also fail"
                );
                self.source
                    .settle(tag, Settlement::Reject { requeue: false })
                    .await?;
                return Ok(TaskOutcome::Rejected);
            }
        };

        let plan = plan_workload(task.no_of_tasks, self.core_count);
        let budget = WorkerBudget::new(plan.tasks_per_worker)?;

        // Task messages carry no emails; a redelivery would only repeat the sizing.
        self.source.settle(tag, Settlement::Ack).await?;

        tracing::info!(
            no_of_tasks = task.no_of_tasks,
            worker_count = plan.worker_count,
            tasks_per_worker = plan.tasks_per_worker,
            "Dispatching workers"
        );

        let launch = self.launcher.launch(plan.worker_count, budget).await?;
        Ok(TaskOutcome::Dispatched { plan, launch })
    }

    /// Stop consuming and release the scheduler's own broker connection.
    /// Spawned workers are left to finish on their own.
    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        self.source.close().await?;
        tracing::info!(parent: &self.span, "Task scheduler stopped consuming");
        Ok(())
    }
}
