//! Delivery targets for outbox messages.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use super::types::OutboxMessage;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("logistics endpoint unreachable: {0}")]
    Transport(String),

    #[error("logistics endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Hands one outbox message to the logistics collaborator.
///
/// Delivery is at least once: implementations see the same message again
/// after a failure or an expired lease, and should pass `message.id` on so
/// the receiver can deduplicate.
#[async_trait::async_trait]
pub trait LogisticsNotifier: Send + Sync {
    async fn notify(&self, message: &OutboxMessage) -> Result<(), NotifyError>;
}

#[async_trait::async_trait]
impl<N> LogisticsNotifier for Arc<N>
where
    N: LogisticsNotifier + ?Sized,
{
    async fn notify(&self, message: &OutboxMessage) -> Result<(), NotifyError> {
        (**self).notify(message).await
    }
}

/// Writes each message to the log. Used when no logistics endpoint is
/// configured.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait::async_trait]
impl LogisticsNotifier for LoggingNotifier {
    async fn notify(&self, message: &OutboxMessage) -> Result<(), NotifyError> {
        info!(
            outbox_id = %message.id,
            topic = %message.topic,
            attempt = message.attempts,
            payload = %message.payload,
            "logistics notification"
        );
        Ok(())
    }
}

/// POSTs the message payload as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpLogisticsNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpLogisticsNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl LogisticsNotifier for HttpLogisticsNotifier {
    async fn notify(&self, message: &OutboxMessage) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", message.id.to_string())
            .header("X-Outbox-Topic", message.topic.as_str())
            .json(&message.payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
