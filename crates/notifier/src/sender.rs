//! Email delivery capability.
//!
//! Workers only see [`NotificationSender`]: success makes a message
//! ack-eligible, any [`NotificationError`] makes it retry-eligible.
//! [`SendGridSender`] is the production implementation over the SendGrid v3
//! mail API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;

use flood_common::config::AppConfig;
use flood_common::error::AppError;

/// Everything needed to render and send one flood notification email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailNotification {
    pub subscriber_id: String,
    pub email: String,
    pub subject: String,
    pub flood_area_id: String,
    pub flood_description: String,
    pub severity: String,
    pub message: String,
    pub colour: String,
}

/// Delivery failed. Always retry-eligible.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected email with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Opaque send operation used by workers.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &EmailNotification) -> Result<(), NotificationError>;
}

/// SendGrid-backed email sender.
#[derive(Debug, Clone)]
pub struct SendGridSender {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from_email: String,
    reply_email: Option<String>,
    flood_map_host: String,
}

impl SendGridSender {
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        api_key: String,
        from_email: String,
        reply_email: Option<String>,
        flood_map_host: String,
    ) -> Self {
        Self {
            client,
            api_url,
            api_key,
            from_email,
            reply_email,
            flood_map_host,
        }
    }

    /// Build a sender from configuration. The API key and sender address are required.
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let api_key = config.sendgrid_api_key.clone().ok_or_else(|| {
            AppError::Config("SENDGRID_EMAIL_API_KEY environment variable is required".into())
        })?;
        let from_email = config.sendgrid_from_email.clone().ok_or_else(|| {
            AppError::Config("SENDGRID_FROM_EMAIL environment variable is required".into())
        })?;

        Ok(Self::new(
            http_client(config.sendgrid_timeout())?,
            config.sendgrid_api_url.clone(),
            api_key,
            from_email,
            config.sendgrid_reply_email.clone(),
            config.flood_map_host_name.clone(),
        ))
    }

    /// Link to the flood map, focused on the notified area.
    pub fn flood_map_url(&self, flood_area_id: &str) -> String {
        format!(
            "http://{}/flood-map?floodAreaID={}",
            self.flood_map_host, flood_area_id
        )
    }

    /// Render the SendGrid v3 `mail/send` request body.
    pub fn build_payload(&self, notification: &EmailNotification) -> serde_json::Value {
        let html = format!(
            concat!(
                "<h2>{description}</h2>",
                "<p><strong>Flood area:</strong> {area}</p>",
                "<p><strong>Severity:</strong> {severity}</p>",
                "<p>{message}</p>",
                "<p><a href=\"{url}\" style=\"background-color:{colour};color:#000000;",
                "padding:10px 16px;text-decoration:none;border-radius:4px;\">",
                "View on flood map</a></p>"
            ),
            description = escape_html(&notification.flood_description),
            area = escape_html(&notification.flood_area_id),
            severity = escape_html(&notification.severity),
            message = escape_html(&notification.message),
            url = self.flood_map_url(&notification.flood_area_id),
            colour = notification.colour,
        );

        let mut payload = json!({
            "personalizations": [{
                "to": [{ "email": notification.email }],
                "custom_args": { "subscriber_id": notification.subscriber_id }
            }],
            "from": { "email": self.from_email },
            "subject": notification.subject,
            "content": [{ "type": "text/html", "value": html }]
        });

        if let Some(reply) = &self.reply_email {
            payload["reply_to"] = json!({ "email": reply });
        }

        payload
    }
}

#[async_trait]
impl NotificationSender for SendGridSender {
    async fn send(&self, notification: &EmailNotification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&self.build_payload(notification))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                subscriber_id = %notification.subscriber_id,
                status = status.as_u16(),
                "Email accepted by provider"
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotificationError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// HTTP client whose requests fail once `timeout` passes without a full response.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
