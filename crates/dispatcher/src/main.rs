use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use flood_common::broker::AmqpQueue;
use flood_common::config::AppConfig;
use flood_common::types::TASKS_QUEUE;
use flood_dispatcher::launcher::{AmqpWorkerFactory, PoolLauncher};
use flood_dispatcher::scheduler::TaskScheduler;
use flood_notifier::sender::SendGridSender;

/// The scheduler holds one unacknowledged task message at a time.
const SCHEDULER_PREFETCH: u16 = 1;

/// Log destination: appended to `log_file` when set, stdout otherwise.
/// The flag says whether ANSI colours should be written.
fn log_writer(log_file: Option<&str>) -> anyhow::Result<(BoxMakeWriter, bool)> {
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Could not open log file {}: {}", path, e))?;
            Ok((BoxMakeWriter::new(Mutex::new(file)), false))
        }
        None => Ok((BoxMakeWriter::new(std::io::stdout), true)),
    }
}

fn init_tracing(json: bool, log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("flood_dispatcher=info,flood_notifier=info,flood_common=info")
    });
    let (writer, ansi) = log_writer(log_file)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (BUILD decides the log format, LOG_FILE_LOCATION the destination)
    let config = AppConfig::from_env()?;
    init_tracing(config.is_production(), config.log_file_location.as_deref())?;

    tracing::info!("Flood notification dispatcher starting...");

    let sender = Arc::new(SendGridSender::from_config(&config)?);

    // Connect to the broker; nothing is consumed if this fails
    let source = AmqpQueue::open(
        &config.amqp_url,
        TASKS_QUEUE,
        SCHEDULER_PREFETCH,
        "flood-dispatcher",
    )
    .await
    .inspect_err(|e| {
        tracing::error!(error = %e, "Could not connect to RabbitMQ. Ensure RabbitMQ is running.");
    })?;

    let launcher = PoolLauncher::new(AmqpWorkerFactory::new(config.amqp_url.clone()), sender)
        .with_inactivity_timeout(config.worker_inactivity_timeout())
        .with_start_attempts(config.worker_start_attempts)
        .with_start_backoff(config.worker_start_backoff());

    let mut scheduler = TaskScheduler::new(source, launcher);

    // Run with graceful shutdown on Ctrl+C
    let result = tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "Task scheduler exited with error");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping task consumption...");
            Ok(())
        }
    };

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Failed to close scheduler connection cleanly");
    }

    // Spawned workers keep their own lifecycle; let them finish.
    let mut launcher = scheduler.into_launcher();
    let reports = launcher.wait_for_workers().await;
    let sent: u64 = reports.iter().map(|r| r.acked).sum();
    tracing::info!(workers = reports.len(), sent, "Flood notification dispatcher stopped.");

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_is_appended() {
        let path =
            std::env::temp_dir().join(format!("flood-dispatcher-{}.log", uuid::Uuid::new_v4()));
        std::fs::write(&path, "earlier run\n").unwrap();

        let (writer, ansi) = log_writer(path.to_str()).unwrap();
        assert!(!ansi);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(ansi)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(workers = 3, "Dispatching workers");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(contents.starts_with("earlier run\n"));
        assert!(contents.contains("Dispatching workers"));
        assert!(contents.contains("workers=3"));
    }

    #[test]
    fn test_unwritable_log_file_is_an_error() {
        let path = std::env::temp_dir()
            .join(format!("flood-missing-{}", uuid::Uuid::new_v4()))
            .join("dispatcher.log");
        assert!(log_writer(path.to_str()).is_err());
    }
}
