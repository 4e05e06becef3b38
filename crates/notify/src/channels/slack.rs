//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::post_webhook;
use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Slack incoming-webhook channel.
pub struct SlackChannel {
    webhook_url: String,
    channel: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a Slack channel for a resolved webhook URL.
    ///
    /// `channel` overrides the webhook's default channel when set.
    #[must_use]
    pub fn new(webhook_url: String, channel: Option<String>, client: reqwest::Client) -> Self {
        Self {
            webhook_url,
            channel: channel.filter(|c| !c.trim().is_empty()),
            client,
        }
    }

    /// Format an event as a Slack webhook payload.
    fn format_payload(&self, event: &NotifyEvent) -> SlackPayload {
        let fields = event
            .fields()
            .into_iter()
            .map(|(title, value)| SlackField {
                title,
                value,
                short: true,
            })
            .collect();

        let attachment = SlackAttachment {
            fallback: event.title(),
            color: event.severity().hex_color().to_string(),
            author_name: Some("Remediation Controller".to_string()),
            title: event.title(),
            text: event.description(),
            fields,
            footer: Some(format!(
                "{} | {}",
                event.severity().as_str(),
                event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(event.timestamp().timestamp()),
        };

        SlackPayload {
            channel: self.channel.clone(),
            attachments: vec![attachment],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let payload = self.format_payload(event);
        debug!(channel = "slack", title = %event.title(), "Sending notification");
        post_webhook(&self.client, self.name(), &self.webhook_url, &payload).await
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSummary;
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn started() -> NotifyEvent {
        NotifyEvent::RemediationStarted {
            policy: "sample".to_string(),
            namespace: "ops".to_string(),
            mode: "manual".to_string(),
            event: EventSummary {
                event_type: "Warning".to_string(),
                reason: "FailedScheduling".to_string(),
                object: "Pod/db/payment-db-0".to_string(),
                message: None,
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn payload_carries_channel_override_and_color() {
        let slack = SlackChannel::new(
            "http://unused".to_string(),
            Some("#alerts".to_string()),
            reqwest::Client::new(),
        );
        let payload = serde_json::to_value(slack.format_payload(&started())).unwrap();
        assert_eq!(payload["channel"], "#alerts");
        assert_eq!(payload["attachments"][0]["color"], "#3498db");
        assert_eq!(payload["attachments"][0]["fields"][0]["value"], "ops/sample");
    }

    #[test]
    fn blank_channel_is_omitted() {
        let slack = SlackChannel::new(
            "http://unused".to_string(),
            Some("  ".to_string()),
            reqwest::Client::new(),
        );
        let payload = serde_json::to_value(slack.format_payload(&started())).unwrap();
        assert!(payload.get("channel").is_none());
    }

    #[tokio::test]
    async fn send_reports_rejected_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({"channel": "#ops"})))
            .respond_with(ResponseTemplate::new(403).set_body_string("invalid_token"))
            .expect(1)
            .mount(&server)
            .await;

        let slack = SlackChannel::new(
            format!("{}/hook", server.uri()),
            Some("#ops".to_string()),
            reqwest::Client::new(),
        );
        let err = slack.send(&started()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Rejected { status: 403, .. }));
    }
}
