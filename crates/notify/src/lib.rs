//! Chat-webhook notifications for remediation lifecycle events.
//!
//! This crate formats remediation start/completion events and delivers them
//! to Slack and Google Chat incoming webhooks.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use notify::{EventSummary, Notifier, NotifyEvent, SlackChannel};
//!
//! # async fn run() {
//! let slack = SlackChannel::new(
//!     "https://hooks.slack.com/services/T000/B000/XXX".to_string(),
//!     None,
//!     reqwest::Client::new(),
//! );
//! let notifier = Notifier::with_channels(vec![Arc::new(slack)]);
//!
//! // Delivery runs in the background; the handle only reports per-channel results.
//! let handle = notifier.notify(NotifyEvent::RemediationStarted {
//!     policy: "default".to_string(),
//!     namespace: "ops".to_string(),
//!     mode: "manual".to_string(),
//!     event: EventSummary {
//!         event_type: "Warning".to_string(),
//!         reason: "BackOff".to_string(),
//!         object: "Pod/prod/api-0".to_string(),
//!         message: None,
//!     },
//!     timestamp: chrono::Utc::now(),
//! });
//! let _results = handle.await;
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`NotifyChannel`] trait defines the interface for notification channels
//! - [`SlackChannel`] and [`GoogleChatChannel`] implement webhook delivery
//! - [`Notifier`] dispatches an event to every configured channel

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::google_chat::GoogleChatChannel;
pub use channels::slack::SlackChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{EventSummary, NotifyEvent, Severity};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Result of delivering one event to one channel.
pub type ChannelOutcome = (&'static str, Result<(), ChannelError>);

/// Dispatches events to a set of channels.
///
/// Cloning is cheap: channels are shared.
#[derive(Clone, Default)]
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
}

impl Notifier {
    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self { channels }
    }

    /// Check if any notification channels are configured.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Get the number of configured channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Send in the background and return immediately.
    ///
    /// Errors are logged here; the handle lets callers inspect per-channel
    /// results without ever blocking the code path that triggered the event.
    #[must_use = "the handle can be dropped, but then delivery failures are only logged"]
    pub fn notify(&self, event: NotifyEvent) -> JoinHandle<Vec<ChannelOutcome>> {
        let notifier = self.clone();
        tokio::spawn(async move { notifier.notify_and_wait(&event).await })
    }

    /// Send to every channel and collect the results.
    pub async fn notify_and_wait(&self, event: &NotifyEvent) -> Vec<ChannelOutcome> {
        if self.channels.is_empty() {
            debug!("No channels configured, skipping event");
            return vec![];
        }

        let mut results = Vec::with_capacity(self.channels.len());

        for channel in &self.channels {
            let channel_name = channel.name();
            let result = channel.send(event).await;
            match &result {
                Ok(()) => debug!(channel = channel_name, "Notification sent"),
                Err(e) => error!(
                    channel = channel_name,
                    error = %e,
                    "Failed to send notification"
                ),
            }
            results.push((channel_name, result));
        }

        results
    }
}
