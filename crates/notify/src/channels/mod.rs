//! Notification channel implementations.

pub mod google_chat;
pub mod slack;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;

/// Trait for notification channels (Slack, Google Chat, etc.).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Send a notification event to this channel.
    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError>;
}

/// POST a JSON payload to a webhook and map non-2xx answers to an error.
///
/// The response body is only read for diagnostics.
pub(crate) async fn post_webhook<T: serde::Serialize + Sync>(
    client: &reqwest::Client,
    channel: &'static str,
    webhook_url: &str,
    payload: &T,
) -> Result<(), ChannelError> {
    let response = client.post(webhook_url).json(payload).send().await?;

    if response.status().is_success() {
        debug!(channel, "Notification sent successfully");
        return Ok(());
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    warn!(
        channel,
        status = %status,
        body = %body,
        "Webhook request failed"
    );

    Err(ChannelError::Rejected {
        channel,
        status: status.as_u16(),
        body,
    })
}
