use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// AMQP connection URI (`AMQP_URL`, or assembled from the `RABBITMQ_*` parts)
    pub amqp_url: String,

    /// Seconds a worker waits for the next email message before draining (default: 5)
    pub worker_inactivity_timeout_secs: u64,

    /// Connection attempts per worker start before the launcher gives up on it (default: 2)
    pub worker_start_attempts: u32,

    /// Milliseconds before the first worker connection retry; doubles per retry (default: 250)
    pub worker_start_backoff_ms: u64,

    /// SendGrid API key for email delivery
    pub sendgrid_api_key: Option<String>,

    /// Email sender address
    pub sendgrid_from_email: Option<String>,

    /// Optional reply-to address
    pub sendgrid_reply_email: Option<String>,

    /// SendGrid mail send endpoint
    pub sendgrid_api_url: String,

    /// Seconds before an unanswered SendGrid request fails (default: 30)
    pub sendgrid_timeout_secs: u64,

    /// Host serving the flood map linked from every notification
    pub flood_map_host_name: String,

    /// Build flavour; `production` switches logs to JSON
    pub build: String,

    /// Append logs to this file instead of stdout
    pub log_file_location: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let amqp_url = match std::env::var("AMQP_URL") {
            Ok(url) => url,
            Err(_) => {
                let host =
                    std::env::var("RABBITMQ_HOST").unwrap_or_else(|_| "localhost".to_string());
                let port: u16 = std::env::var("RABBITMQ_PORT")
                    .unwrap_or_else(|_| "5672".to_string())
                    .parse()
                    .map_err(|_| anyhow::anyhow!("RABBITMQ_PORT must be a valid u16"))?;
                let user = std::env::var("RABBITMQ_USER").unwrap_or_else(|_| "guest".to_string());
                let password =
                    std::env::var("RABBITMQ_PASSWORD").unwrap_or_else(|_| "guest".to_string());
                amqp_uri(&host, port, &user, &password)
            }
        };

        let worker_start_attempts: u32 = std::env::var("WORKER_START_ATTEMPTS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .map_err(|_| anyhow::anyhow!("WORKER_START_ATTEMPTS must be a valid u32"))?;
        if worker_start_attempts == 0 {
            anyhow::bail!("WORKER_START_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            amqp_url,
            worker_inactivity_timeout_secs: std::env::var("WORKER_INACTIVITY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| {
                    anyhow::anyhow!("WORKER_INACTIVITY_TIMEOUT_SECS must be a valid u64")
                })?,
            worker_start_attempts,
            worker_start_backoff_ms: std::env::var("WORKER_START_BACKOFF_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_START_BACKOFF_MS must be a valid u64"))?,
            sendgrid_api_key: std::env::var("SENDGRID_EMAIL_API_KEY").ok(),
            sendgrid_from_email: std::env::var("SENDGRID_FROM_EMAIL").ok(),
            sendgrid_reply_email: std::env::var("SENDGRID_REPLY_EMAIL").ok(),
            sendgrid_api_url: std::env::var("SENDGRID_API_URL")
                .unwrap_or_else(|_| "https://api.sendgrid.com/v3/mail/send".to_string()),
            sendgrid_timeout_secs: std::env::var("SENDGRID_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SENDGRID_TIMEOUT_SECS must be a valid u64"))?,
            flood_map_host_name: std::env::var("FLOOD_MAP_HOST_NAME")
                .unwrap_or_else(|_| "localhost".to_string()),
            build: std::env::var("BUILD").unwrap_or_else(|_| "development".to_string()),
            log_file_location: std::env::var("LOG_FILE_LOCATION")
                .ok()
                .filter(|path| !path.is_empty()),
        })
    }

    pub fn worker_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_inactivity_timeout_secs)
    }

    pub fn worker_start_backoff(&self) -> Duration {
        Duration::from_millis(self.worker_start_backoff_ms)
    }

    pub fn sendgrid_timeout(&self) -> Duration {
        Duration::from_secs(self.sendgrid_timeout_secs)
    }

    pub fn is_production(&self) -> bool {
        self.build.eq_ignore_ascii_case("production")
    }
}

/// Assemble an AMQP URI on the default vhost.
pub fn amqp_uri(host: &str, port: u16, user: &str, password: &str) -> String {
    format!("amqp://{}:{}@{}:{}/%2f", user, password, host, port)
}
