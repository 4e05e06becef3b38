//! Remediation backend client
//!
//! Builds the backend request for a matched event and POSTs it, retrying
//! transient failures through [`RetryPolicy`]. Only the final attempt's
//! outcome is reported.

use super::error::DispatchError;
use super::event::ClusterEvent;
use super::retry::{RetryPolicy, RetryStep};
use super::selector::EffectiveSettings;
use super::status::truncate;
use crate::crds::{RemediationMode, RiskLevel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Bytes of an error response body kept for diagnostics
const ERROR_BODY_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvolvedObjectRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub involved_object: InvolvedObjectRef,
}

/// Body POSTed to the remediation backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequest {
    /// Human-readable summary of the problem
    pub issue: String,
    pub mode: RemediationMode,
    pub event: EventPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_risk_level: Option<RiskLevel>,
}

impl RemediationRequest {
    /// Thresholds are only sent when the backend may act on its own.
    #[must_use]
    pub fn build(event: &ClusterEvent, settings: &EffectiveSettings) -> Self {
        let object = &event.involved_object;
        let target = if object.namespace.is_empty() {
            object.name.clone()
        } else {
            format!("{}/{}", object.namespace, object.name)
        };
        let mut issue = format!(
            "{} event {} on {} {target}",
            event.event_type, event.reason, object.kind
        );
        if !event.message.is_empty() {
            issue.push_str(": ");
            issue.push_str(&event.message);
        }

        let automatic = settings.mode == RemediationMode::Automatic;
        Self {
            issue,
            mode: settings.mode,
            event: EventPayload {
                event_type: event.event_type.clone(),
                reason: event.reason.clone(),
                message: event.message.clone(),
                involved_object: InvolvedObjectRef {
                    kind: object.kind.clone(),
                    name: object.name.clone(),
                    namespace: object.namespace.clone(),
                },
            },
            confidence_threshold: automatic.then_some(settings.confidence_threshold),
            max_risk_level: automatic.then_some(settings.max_risk_level),
        }
    }
}

/// Backend reply; only `success` is required.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "actions_taken")]
    pub actions_taken: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Sends remediation requests with retries.
#[derive(Clone)]
pub struct RemediationDispatcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RemediationDispatcher {
    #[must_use]
    pub fn new(client: reqwest::Client, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            client,
            retry,
            timeout,
        }
    }

    /// POST `request` to `endpoint` until it succeeds, fails terminally, or
    /// the retry budget runs out.
    pub async fn dispatch(
        &self,
        endpoint: &str,
        token: Option<&str>,
        request: &RemediationRequest,
    ) -> Result<RemediationResponse, DispatchError> {
        let mut backoff = self.retry.start();

        loop {
            let attempt = backoff.attempt();
            let err = match self.attempt(endpoint, token, request).await {
                Ok(response) => {
                    debug!(attempt, actions = response.actions_taken.len(), "Remediation backend succeeded");
                    return Ok(response);
                }
                Err(e) => e,
            };

            match backoff.on_failure(err.is_retryable()) {
                RetryStep::RetryAfter { delay, .. } => {
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Remediation attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryStep::GiveUp => return Err(err),
            }
        }
    }

    async fn attempt(
        &self,
        endpoint: &str,
        token: Option<&str>,
        request: &RemediationRequest,
    ) -> Result<RemediationResponse, DispatchError> {
        let mut builder = self.client.post(endpoint).timeout(self.timeout).json(request);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body: truncate(&body, ERROR_BODY_BYTES),
            });
        }

        let parsed: RemediationResponse = serde_json::from_str(&body)
            .map_err(|e| DispatchError::MalformedResponse(e.to_string()))?;
        if !parsed.success {
            let reason = parsed
                .error
                .or(parsed.message)
                .unwrap_or_else(|| "backend returned success=false".to_string());
            return Err(DispatchError::Rejected(reason));
        }
        Ok(parsed)
    }

    fn transport_error(&self, err: reqwest::Error) -> DispatchError {
        if err.is_timeout() {
            DispatchError::Timeout(self.timeout.as_secs())
        } else {
            DispatchError::Transport(err)
        }
    }
}
