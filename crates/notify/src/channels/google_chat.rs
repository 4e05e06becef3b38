//! Google Chat webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::post_webhook;
use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Google Chat space webhook channel (cards v2 payloads).
pub struct GoogleChatChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl GoogleChatChannel {
    #[must_use]
    pub fn new(webhook_url: String, client: reqwest::Client) -> Self {
        Self {
            webhook_url,
            client,
        }
    }

    fn format_payload(event: &NotifyEvent) -> ChatPayload {
        let mut widgets = vec![Widget {
            text_paragraph: Some(TextParagraph {
                text: event.description(),
            }),
            decorated_text: None,
        }];
        widgets.extend(event.fields().into_iter().map(|(label, value)| Widget {
            text_paragraph: None,
            decorated_text: Some(DecoratedText {
                top_label: label,
                text: value,
            }),
        }));

        ChatPayload {
            text: event.title(),
            cards_v2: vec![CardWrapper {
                card_id: "remediation".to_string(),
                card: Card {
                    header: CardHeader {
                        title: event.title(),
                        subtitle: format!(
                            "{} | {}",
                            event.severity().as_str(),
                            event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
                        ),
                    },
                    sections: vec![Section { widgets }],
                },
            }],
        }
    }
}

#[async_trait]
impl NotifyChannel for GoogleChatChannel {
    fn name(&self) -> &'static str {
        "google-chat"
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let payload = Self::format_payload(event);
        debug!(channel = "google-chat", title = %event.title(), "Sending notification");
        post_webhook(&self.client, self.name(), &self.webhook_url, &payload).await
    }
}

// =============================================================================
// Google Chat API types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatPayload {
    text: String,
    cards_v2: Vec<CardWrapper>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CardWrapper {
    card_id: String,
    card: Card,
}

#[derive(Debug, Serialize)]
struct Card {
    header: CardHeader,
    sections: Vec<Section>,
}

#[derive(Debug, Serialize)]
struct CardHeader {
    title: String,
    subtitle: String,
}

#[derive(Debug, Serialize)]
struct Section {
    widgets: Vec<Widget>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Widget {
    #[serde(skip_serializing_if = "Option::is_none")]
    text_paragraph: Option<TextParagraph>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decorated_text: Option<DecoratedText>,
}

#[derive(Debug, Serialize)]
struct TextParagraph {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecoratedText {
    top_label: String,
    text: String,
}
