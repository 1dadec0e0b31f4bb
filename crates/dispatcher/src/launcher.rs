//! Worker pool launcher.
//!
//! Every worker gets its own broker connection and runs as an independent
//! tokio task; the only thing workers share is the `email` queue on the
//! broker. A worker that fails to connect is retried a bounded number of
//! times and then skipped, so one bad start never blocks its siblings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use flood_common::broker::{AmqpQueue, QueueSource};
use flood_common::error::AppError;
use flood_common::types::EMAIL_QUEUE;
use flood_notifier::sender::NotificationSender;
use flood_notifier::worker::{DEFAULT_INACTIVITY_TIMEOUT, Worker, WorkerBudget, WorkerReport};

/// Default connection attempts per worker.
const DEFAULT_START_ATTEMPTS: u32 = 2;

/// Wait before the first connection retry; doubled on each further retry.
pub const DEFAULT_START_BACKOFF: Duration = Duration::from_millis(250);

/// Upper bound on the wait between connection retries.
const MAX_START_BACKOFF: Duration = Duration::from_secs(5);

/// Workers pull one unacknowledged message at a time.
const WORKER_PREFETCH: u16 = 1;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("none of {requested} workers could connect to the broker: {source}")]
    NoWorkersStarted {
        requested: u64,
        #[source]
        source: AppError,
    },
}

/// Result of one launch batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchSummary {
    pub requested: u64,
    pub started: u64,
}

/// Starts a batch of workers with a shared per-worker budget.
#[async_trait]
pub trait WorkerLauncher: Send {
    async fn launch(
        &mut self,
        worker_count: u64,
        budget: WorkerBudget,
    ) -> Result<LaunchSummary, LaunchError>;
}

/// Opens the queue consumer a new worker will own.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    type Source: QueueSource + 'static;

    async fn connect(&self) -> Result<Self::Source, AppError>;
}

/// Connects each worker to the `email` quorum queue over its own AMQP connection.
pub struct AmqpWorkerFactory {
    amqp_url: String,
}

impl AmqpWorkerFactory {
    pub fn new(amqp_url: String) -> Self {
        Self { amqp_url }
    }
}

#[async_trait]
impl WorkerFactory for AmqpWorkerFactory {
    type Source = AmqpQueue;

    async fn connect(&self) -> Result<AmqpQueue, AppError> {
        let consumer_tag = format!("flood-worker-{}", Uuid::new_v4());
        AmqpQueue::open(&self.amqp_url, EMAIL_QUEUE, WORKER_PREFETCH, &consumer_tag).await
    }
}

/// Delay before the next connection attempt after `failures_so_far` failed ones (0-based).
pub fn start_backoff(initial: Duration, failures_so_far: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures_so_far);
    initial.saturating_mul(factor).min(MAX_START_BACKOFF)
}

type WorkerHandle = JoinHandle<Result<WorkerReport, AppError>>;

/// Spawns workers as supervised tokio tasks and keeps their join handles.
pub struct PoolLauncher<F> {
    factory: F,
    sender: Arc<dyn NotificationSender>,
    inactivity_timeout: Duration,
    start_attempts: u32,
    start_backoff: Duration,
    handles: Vec<WorkerHandle>,
}

impl<F: WorkerFactory> PoolLauncher<F> {
    pub fn new(factory: F, sender: Arc<dyn NotificationSender>) -> Self {
        Self {
            factory,
            sender,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            start_attempts: DEFAULT_START_ATTEMPTS,
            start_backoff: DEFAULT_START_BACKOFF,
            handles: Vec::new(),
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_start_attempts(mut self, attempts: u32) -> Self {
        self.start_attempts = attempts.max(1);
        self
    }

    pub fn with_start_backoff(mut self, backoff: Duration) -> Self {
        self.start_backoff = backoff;
        self
    }

    /// Workers spawned and not yet reaped.
    pub fn active_workers(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every spawned worker to finish under its own budget/timeout.
    pub async fn wait_for_workers(&mut self) -> Vec<WorkerReport> {
        let handles = std::mem::take(&mut self.handles);
        if !handles.is_empty() {
            tracing::info!(
                workers = handles.len(),
                "Waiting for in-flight workers to finish"
            );
        }

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(report) = Self::collect(handle).await {
                reports.push(report);
            }
        }
        reports
    }

    /// Drop handles of workers that already finished, logging any that failed.
    async fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.handles)
            .into_iter()
            .partition(|h| h.is_finished());
        self.handles = running;

        for handle in finished {
            Self::collect(handle).await;
        }
    }

    async fn collect(handle: WorkerHandle) -> Option<WorkerReport> {
        match handle.await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Worker exited with error");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker task panicked or was cancelled");
                None
            }
        }
    }

    /// Connect and spawn a single worker, retrying the connection.
    async fn start_worker(&self, index: u64, budget: WorkerBudget) -> Result<WorkerHandle, AppError> {
        let mut attempt = 1;
        loop {
            match self.factory.connect().await {
                Ok(source) => {
                    let worker = Worker::new(source, self.sender.clone(), budget)
                        .with_inactivity_timeout(self.inactivity_timeout);
                    let span = tracing::info_span!(
                        parent: None,
                        "worker",
                        worker_id = %worker.id(),
                        index,
                        budget = budget.max_messages()
                    );
                    let worker = worker.with_span(span);
                    tracing::debug!(worker_id = %worker.id(), index, attempt, "Worker started");
                    return Ok(tokio::spawn(worker.run()));
                }
                Err(e) if attempt < self.start_attempts => {
                    let delay = start_backoff(self.start_backoff, attempt - 1);
                    tracing::warn!(
                        index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Worker failed to connect, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<F: WorkerFactory> WorkerLauncher for PoolLauncher<F> {
    async fn launch(
        &mut self,
        worker_count: u64,
        budget: WorkerBudget,
    ) -> Result<LaunchSummary, LaunchError> {
        self.reap_finished().await;

        let mut started = 0;
        let mut last_error = None;

        for index in 0..worker_count {
            match self.start_worker(index, budget).await {
                Ok(handle) => {
                    self.handles.push(handle);
                    started += 1;
                }
                Err(e) => {
                    tracing::error!(
                        index,
                        error = %e,
                        "Could not start worker, continuing with remaining workers"
                    );
                    last_error = Some(e);
                }
            }
        }

        if started == 0
            && let Some(source) = last_error
        {
            return Err(LaunchError::NoWorkersStarted {
                requested: worker_count,
                source,
            });
        }

        if started < worker_count {
            tracing::warn!(requested = worker_count, started, "Partial worker launch");
        } else {
            tracing::info!(
                workers = started,
                budget = budget.max_messages(),
                "Workers launched"
            );
        }

        Ok(LaunchSummary {
            requested: worker_count,
            started,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use flood_common::memory::{MemoryConsumer, MemoryQueue};
    use flood_notifier::sender::{EmailNotification, NotificationError};

    use super::*;

    struct MemoryFactory {
        queue: MemoryQueue,
        /// Number of upcoming connect calls that fail.
        failures: AtomicU32,
        attempts: AtomicU32,
    }

    impl MemoryFactory {
        fn new(queue: MemoryQueue, failures: u32) -> Self {
            Self {
                queue,
                failures: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkerFactory for MemoryFactory {
        type Source = MemoryConsumer;

        async fn connect(&self) -> Result<MemoryConsumer, AppError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::Internal("connection refused".into()));
            }
            Ok(self.queue.consumer())
        }
    }

    #[derive(Default)]
    struct CountingSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSender for CountingSender {
        async fn send(&self, notification: &EmailNotification) -> Result<(), NotificationError> {
            self.sent
                .lock()
                .unwrap()
                .push(notification.subscriber_id.clone());
            Ok(())
        }
    }

    fn body(subscriber: &str) -> Vec<u8> {
        serde_json::json!({
            "flood": {
                "floodAreaID": "area",
                "description": "desc",
                "severity": "Severe flood warning",
                "severityLevel": 1,
                "message": "msg"
            },
            "subscriber_id": subscriber,
            "subscriber_email": "someone@example.com"
        })
        .to_string()
        .into_bytes()
    }

    fn make_launcher(factory: MemoryFactory, sender: Arc<CountingSender>) -> PoolLauncher<MemoryFactory> {
        PoolLauncher::new(factory, sender)
            .with_inactivity_timeout(Duration::from_millis(50))
            .with_start_attempts(1)
    }

    #[tokio::test]
    async fn test_launch_drains_queue_across_workers() {
        let queue = MemoryQueue::new();
        for i in 0..6 {
            queue.push(body(&format!("sub-{i}")));
        }
        let sender = Arc::new(CountingSender::default());
        let mut launcher = make_launcher(MemoryFactory::new(queue.clone(), 0), sender.clone());

        let summary = launcher
            .launch(3, WorkerBudget::new(2).unwrap())
            .await
            .unwrap();
        assert_eq!(summary, LaunchSummary { requested: 3, started: 3 });

        let reports = launcher.wait_for_workers().await;
        assert_eq!(reports.len(), 3);
        for report in &reports {
            assert!(report.settled() <= 2);
        }
        assert_eq!(sender.sent.lock().unwrap().len(), 6);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.closed_consumers(), 3);
    }

    #[tokio::test]
    async fn test_partial_launch_tolerates_failed_start() {
        let queue = MemoryQueue::new();
        let sender = Arc::new(CountingSender::default());
        let mut launcher = make_launcher(MemoryFactory::new(queue, 1), sender);

        let summary = launcher
            .launch(3, WorkerBudget::new(1).unwrap())
            .await
            .unwrap();
        assert_eq!(summary.started, 2);

        assert_eq!(launcher.wait_for_workers().await.len(), 2);
    }

    #[test]
    fn test_start_backoff_grows_and_caps() {
        let initial = Duration::from_millis(250);
        assert_eq!(start_backoff(initial, 0), Duration::from_millis(250));
        assert_eq!(start_backoff(initial, 1), Duration::from_millis(500));
        assert_eq!(start_backoff(initial, 3), Duration::from_secs(2));
        assert_eq!(start_backoff(initial, 10), MAX_START_BACKOFF);
        assert_eq!(start_backoff(initial, u32::MAX), MAX_START_BACKOFF);
    }

    #[tokio::test]
    async fn test_start_is_retried_after_backoff() {
        let queue = MemoryQueue::new();
        let factory = MemoryFactory::new(queue, 2);
        let mut launcher = PoolLauncher::new(factory, Arc::new(CountingSender::default()))
            .with_inactivity_timeout(Duration::from_millis(20))
            .with_start_attempts(3)
            .with_start_backoff(Duration::from_millis(40));

        let started_at = std::time::Instant::now();
        let summary = launcher
            .launch(1, WorkerBudget::new(1).unwrap())
            .await
            .unwrap();

        // Two failed connects: waits of 40ms then 80ms.
        assert!(started_at.elapsed() >= Duration::from_millis(120));
        assert_eq!(summary.started, 1);
        assert_eq!(launcher.factory.attempts.load(Ordering::SeqCst), 3);
        launcher.wait_for_workers().await;
    }

    #[tokio::test]
    async fn test_no_workers_started_is_fatal() {
        let queue = MemoryQueue::new();
        let mut launcher = make_launcher(
            MemoryFactory::new(queue, u32::MAX),
            Arc::new(CountingSender::default()),
        );

        let err = launcher
            .launch(2, WorkerBudget::new(5).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::NoWorkersStarted { requested: 2, .. }));
        assert_eq!(launcher.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_panicking_worker_does_not_affect_siblings() {
        struct PanickingSender;

        #[async_trait]
        impl NotificationSender for PanickingSender {
            async fn send(&self, n: &EmailNotification) -> Result<(), NotificationError> {
                if n.subscriber_id == "boom" {
                    panic!("renderer crashed");
                }
                Ok(())
            }
        }

        let queue = MemoryQueue::new();
        queue.push(body("boom"));
        queue.push(body("ok"));
        let mut launcher = PoolLauncher::new(
            MemoryFactory::new(queue.clone(), 0),
            Arc::new(PanickingSender),
        )
        .with_inactivity_timeout(Duration::from_millis(50));

        launcher
            .launch(2, WorkerBudget::new(1).unwrap())
            .await
            .unwrap();
        let reports = launcher.wait_for_workers().await;

        // The sibling worker still acked its message.
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].acked, 1);
    }
}
