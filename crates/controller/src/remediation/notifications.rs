//! Chat notification wiring for a policy
//!
//! Webhook URLs come from a Secret reference or, deprecated, straight from the
//! policy spec. Resolution problems and delivery failures only ever show up in
//! the `NotificationsHealthy` condition; remediation carries on regardless.

use super::error::ResolveError;
use super::status::{StatusAggregator, CONDITION_NOTIFICATIONS};
use crate::crds::{Notifications, SecretKeyRef, WebhookNotification};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use notify::{GoogleChatChannel, Notifier, NotifyChannel, NotifyEvent, SlackChannel};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Secret access used for webhook URLs and backend tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretLookup: Send + Sync {
    /// Secret data, `None` when the secret does not exist
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, kube::Error>;
}

#[derive(Clone)]
pub struct KubeSecretLookup {
    client: Client,
}

impl KubeSecretLookup {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretLookup for KubeSecretLookup {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, kube::Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?.map(|secret| {
            let mut data: BTreeMap<String, Vec<u8>> = secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect();
            // stringData is write-only on the API, but fakes and dry runs may carry it
            for (key, value) in secret.string_data.unwrap_or_default() {
                data.entry(key).or_insert_with(|| value.into_bytes());
            }
            data
        }))
    }
}

/// Read one key of a Secret as a trimmed, non-empty string.
pub async fn resolve_secret_value<L: SecretLookup + ?Sized>(
    lookup: &L,
    namespace: &str,
    secret_ref: &SecretKeyRef,
) -> Result<String, ResolveError> {
    let data = lookup
        .secret_data(namespace, &secret_ref.name)
        .await?
        .ok_or_else(|| ResolveError::SecretNotFound {
            namespace: namespace.to_string(),
            name: secret_ref.name.clone(),
        })?;

    let raw = data.get(&secret_ref.key).ok_or_else(|| ResolveError::KeyMissing {
        name: secret_ref.name.clone(),
        key: secret_ref.key.clone(),
    })?;

    let value = std::str::from_utf8(raw).map_err(|_| ResolveError::InvalidUtf8 {
        name: secret_ref.name.clone(),
        key: secret_ref.key.clone(),
    })?;

    let value = value.trim();
    if value.is_empty() {
        return Err(ResolveError::EmptyValue {
            name: secret_ref.name.clone(),
            key: secret_ref.key.clone(),
        });
    }
    Ok(value.to_string())
}

/// Webhook URL for one channel. The secret reference wins over the
/// deprecated plaintext URL; `None` means the channel is skipped.
pub async fn resolve_webhook_url<L: SecretLookup + ?Sized>(
    lookup: &L,
    namespace: &str,
    channel: &str,
    config: &WebhookNotification,
) -> Result<Option<String>, ResolveError> {
    if !config.enabled {
        return Ok(None);
    }

    let plaintext = config.webhook_url.as_deref().filter(|url| !url.trim().is_empty());

    if let Some(secret_ref) = &config.webhook_url_secret_ref {
        if plaintext.is_some() {
            warn!(
                channel,
                secret = %secret_ref.name,
                "Both webhookUrl and webhookUrlSecretRef set; using the secret, webhookUrl is deprecated"
            );
        }
        return resolve_secret_value(lookup, namespace, secret_ref).await.map(Some);
    }

    if let Some(url) = plaintext {
        debug!(channel, "Using plaintext webhookUrl");
        return Ok(Some(url.trim().to_string()));
    }

    debug!(channel, "Channel enabled without a webhook, skipping");
    Ok(None)
}

/// Health of the notification setup, mirrored into `NotificationsHealthy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationHealth {
    pub healthy: bool,
    pub reason: String,
    pub message: String,
}

impl NotificationHealth {
    fn ok(channels: usize) -> Self {
        Self {
            healthy: true,
            reason: if channels == 0 { "NotConfigured" } else { "Resolved" }.to_string(),
            message: format!("{channels} notification channel(s) configured"),
        }
    }
}

/// Start and completion notifiers for one policy.
#[derive(Clone, Default)]
pub struct PolicyNotifications {
    on_start: Notifier,
    on_complete: Notifier,
    /// Last health written to status, so only changes are recorded
    healthy: Arc<AtomicBool>,
}

impl PolicyNotifications {
    /// Resolve every enabled channel. Channels that fail to resolve are left
    /// out and reported through the returned health.
    pub async fn build<L: SecretLookup + ?Sized>(
        lookup: &L,
        namespace: &str,
        config: &Notifications,
        client: &reqwest::Client,
    ) -> (Self, NotificationHealth) {
        let mut on_start: Vec<Arc<dyn NotifyChannel>> = Vec::new();
        let mut on_complete: Vec<Arc<dyn NotifyChannel>> = Vec::new();
        let mut failures = Vec::new();
        let mut first_reason = None;

        let configured = [("slack", config.slack.as_ref()), ("googleChat", config.google_chat.as_ref())];
        for (name, channel_config) in configured {
            let Some(channel_config) = channel_config else {
                continue;
            };

            let url = match resolve_webhook_url(lookup, namespace, name, channel_config).await {
                Ok(Some(url)) => url,
                Ok(None) => continue,
                Err(e) => {
                    warn!(channel = name, error = %e, "Could not resolve webhook URL");
                    first_reason.get_or_insert(e.reason());
                    failures.push(format!("{name}: {e}"));
                    continue;
                }
            };

            let channel: Arc<dyn NotifyChannel> = if name == "slack" {
                Arc::new(SlackChannel::new(url, channel_config.channel.clone(), client.clone()))
            } else {
                Arc::new(GoogleChatChannel::new(url, client.clone()))
            };
            if channel_config.notify_on_start {
                on_start.push(Arc::clone(&channel));
            }
            if channel_config.notify_on_complete {
                on_complete.push(channel);
            }
        }

        let channels = on_start.len().max(on_complete.len());
        let health = match first_reason {
            None => NotificationHealth::ok(channels),
            Some(reason) => NotificationHealth {
                healthy: false,
                reason: reason.to_string(),
                message: failures.join("; "),
            },
        };

        let notifications = Self {
            on_start: Notifier::with_channels(on_start),
            on_complete: Notifier::with_channels(on_complete),
            healthy: Arc::new(AtomicBool::new(health.healthy)),
        };
        (notifications, health)
    }

    #[must_use]
    pub fn has_channels(&self) -> bool {
        self.on_start.has_channels() || self.on_complete.has_channels()
    }

    /// Send in the background; the caller never waits on delivery.
    pub fn send(&self, event: NotifyEvent, status: Option<Arc<StatusAggregator>>) {
        let notifier = match event {
            NotifyEvent::RemediationStarted { .. } => &self.on_start,
            NotifyEvent::RemediationCompleted { .. } => &self.on_complete,
        };
        if !notifier.has_channels() {
            return;
        }

        let handle = notifier.notify(event);
        let healthy = Arc::clone(&self.healthy);
        tokio::spawn(async move {
            let Ok(results) = handle.await else {
                return;
            };
            let failures: Vec<String> = results
                .iter()
                .filter_map(|(channel, result)| result.as_ref().err().map(|e| format!("{channel}: {e}")))
                .collect();
            let now_healthy = failures.is_empty();

            // Only status flips are written
            if healthy.swap(now_healthy, Ordering::AcqRel) == now_healthy {
                return;
            }
            if let Some(status) = status {
                if now_healthy {
                    status
                        .set_condition(CONDITION_NOTIFICATIONS, true, "Delivered", "notifications delivered")
                        .await;
                } else {
                    status
                        .set_condition(CONDITION_NOTIFICATIONS, false, "DeliveryFailed", failures.join("; "))
                        .await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn secret_ref(name: &str, key: &str) -> SecretKeyRef {
        SecretKeyRef {
            name: name.to_string(),
            key: key.to_string(),
        }
    }

    fn data(key: &str, value: &str) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([(key.to_string(), value.as_bytes().to_vec())])
    }

    fn slack(url: Option<&str>, secret: Option<SecretKeyRef>) -> WebhookNotification {
        WebhookNotification {
            enabled: true,
            webhook_url: url.map(str::to_string),
            webhook_url_secret_ref: secret,
            channel: None,
            notify_on_start: true,
            notify_on_complete: true,
        }
    }

    #[tokio::test]
    async fn secret_reference_wins_over_plaintext() {
        let mut lookup = MockSecretLookup::new();
        lookup
            .expect_secret_data()
            .with(eq("ops"), eq("slack-webhook"))
            .times(1)
            .returning(|_, _| Ok(Some(data("url", "https://hooks.example/secret\n"))));

        let config = slack(Some("https://hooks.example/plain"), Some(secret_ref("slack-webhook", "url")));
        let url = resolve_webhook_url(&lookup, "ops", "slack", &config).await.unwrap();
        assert_eq!(url.as_deref(), Some("https://hooks.example/secret"));
    }

    #[tokio::test]
    async fn plaintext_url_used_without_secret() {
        let mut lookup = MockSecretLookup::new();
        lookup.expect_secret_data().never();

        let config = slack(Some("https://hooks.example/plain"), None);
        let url = resolve_webhook_url(&lookup, "ops", "slack", &config).await.unwrap();
        assert_eq!(url.as_deref(), Some("https://hooks.example/plain"));
    }

    #[tokio::test]
    async fn nothing_configured_is_skipped() {
        let lookup = MockSecretLookup::new();
        assert_eq!(
            resolve_webhook_url(&lookup, "ops", "slack", &slack(None, None)).await.unwrap(),
            None
        );

        let disabled = WebhookNotification {
            enabled: false,
            ..slack(Some("https://hooks.example/plain"), None)
        };
        assert_eq!(
            resolve_webhook_url(&lookup, "ops", "slack", &disabled).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn resolution_failures_are_classified() {
        let mut lookup = MockSecretLookup::new();
        lookup
            .expect_secret_data()
            .with(eq("ops"), eq("missing"))
            .returning(|_, _| Ok(None));
        lookup
            .expect_secret_data()
            .with(eq("ops"), eq("no-key"))
            .returning(|_, _| Ok(Some(data("other", "x"))));
        lookup
            .expect_secret_data()
            .with(eq("ops"), eq("blank"))
            .returning(|_, _| Ok(Some(data("url", "  "))));

        let err = resolve_secret_value(&lookup, "ops", &secret_ref("missing", "url")).await.unwrap_err();
        assert_eq!(err.reason(), "SecretNotFound");
        let err = resolve_secret_value(&lookup, "ops", &secret_ref("no-key", "url")).await.unwrap_err();
        assert_eq!(err.reason(), "SecretKeyMissing");
        let err = resolve_secret_value(&lookup, "ops", &secret_ref("blank", "url")).await.unwrap_err();
        assert_eq!(err.reason(), "SecretValueEmpty");
    }

    #[tokio::test]
    async fn build_reports_unhealthy_on_missing_secret() {
        let mut lookup = MockSecretLookup::new();
        lookup.expect_secret_data().returning(|_, _| Ok(None));

        let config = Notifications {
            slack: Some(slack(None, Some(secret_ref("slack-webhook", "url")))),
            google_chat: Some(WebhookNotification {
                enabled: true,
                webhook_url: Some("https://chat.example/hook".to_string()),
                ..Default::default()
            }),
        };

        let (notifications, health) =
            PolicyNotifications::build(&lookup, "ops", &config, &reqwest::Client::new()).await;
        assert!(!health.healthy);
        assert_eq!(health.reason, "SecretNotFound");
        assert!(health.message.starts_with("slack:"));
        // the channel that resolved is still usable
        assert!(notifications.has_channels());
    }

    #[tokio::test]
    async fn build_without_channels_is_healthy() {
        let lookup = MockSecretLookup::new();
        let (notifications, health) =
            PolicyNotifications::build(&lookup, "ops", &Notifications::default(), &reqwest::Client::new())
                .await;
        assert!(health.healthy);
        assert_eq!(health.reason, "NotConfigured");
        assert!(!notifications.has_channels());
    }
}
