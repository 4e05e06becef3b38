//! `RemediationPolicy` Custom Resource Definition
//!
//! A policy selects cluster events, names the remediation backend to call for
//! them, and carries the rate-limit, notification and persistence settings the
//! pipeline applies per policy.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the backend is allowed to act on a matched event.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemediationMode {
    /// Backend only analyzes and recommends
    #[default]
    Manual,
    /// Backend may execute fixes within the configured thresholds
    Automatic,
}

impl RemediationMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }
}

impl fmt::Display for RemediationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest risk level an automatic remediation may take.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a key inside a Secret in the policy's namespace
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct SecretKeyRef {
    /// Name of the secret
    pub name: String,
    /// Key within the secret
    pub key: String,
}

/// Ordered event-matching rule. Empty fields match anything.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventSelector {
    /// Event type (`Warning` or `Normal`)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Event reason (e.g. `FailedScheduling`, `BackOff`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Kind of the involved object (e.g. `Pod`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub involved_object_kind: Option<String>,

    /// Namespace of the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Per-selector mode override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RemediationMode>,

    /// Per-selector confidence override (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,

    /// Per-selector risk override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_risk_level: Option<RiskLevel>,
}

fn default_events_per_minute() -> u32 {
    10
}

fn default_cooldown_minutes() -> u32 {
    5
}

fn default_confidence_threshold() -> f64 {
    0.8
}

fn default_true() -> bool {
    true
}

/// Rate limiting applied per rate-limit key
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiting {
    /// Maximum events processed per key per minute
    #[serde(default = "default_events_per_minute")]
    pub events_per_minute: u32,

    /// Minimum minutes between two remediations for the same key
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
}

impl Default for RateLimiting {
    fn default() -> Self {
        Self {
            events_per_minute: default_events_per_minute(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

impl RateLimiting {
    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.cooldown_minutes))
    }
}

/// Webhook-based chat notification settings
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    /// Whether this channel is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Plaintext webhook URL (deprecated - use webhookUrlSecretRef)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Secret key holding the webhook URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url_secret_ref: Option<SecretKeyRef>,

    /// Channel override (Slack only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Send a message when a remediation starts
    #[serde(default = "default_true")]
    pub notify_on_start: bool,

    /// Send a message when a remediation completes
    #[serde(default = "default_true")]
    pub notify_on_complete: bool,
}

/// Notification configuration
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<WebhookNotification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_chat: Option<WebhookNotification>,
}

/// Cooldown state persistence settings
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Persistence {
    /// Persist cooldown state so it survives controller restarts
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for Persistence {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// `RemediationPolicy` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "remediation.platform",
    version = "v1alpha1",
    kind = "RemediationPolicy",
    shortname = "rp"
)]
#[kube(namespaced)]
#[kube(status = "RemediationPolicyStatus")]
#[kube(printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#)]
#[kube(printcolumn = r#"{"name":"Processed","type":"integer","jsonPath":".status.totalEventsProcessed"}"#)]
#[kube(printcolumn = r#"{"name":"Succeeded","type":"integer","jsonPath":".status.successfulRemediations"}"#)]
#[kube(printcolumn = r#"{"name":"Failed","type":"integer","jsonPath":".status.failedRemediations"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPolicySpec {
    /// Ordered list of selectors; the first full match wins
    pub event_selectors: Vec<EventSelector>,

    /// Remediation backend endpoint (HTTP POST target)
    pub remediation_endpoint: String,

    /// Secret key holding the backend bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret_ref: Option<SecretKeyRef>,

    /// Default mode for selectors without an override
    #[serde(default)]
    pub mode: RemediationMode,

    /// Default confidence threshold for automatic mode (0.0 - 1.0)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Default maximum risk level for automatic mode
    #[serde(default)]
    pub max_risk_level: RiskLevel,

    #[serde(default)]
    pub rate_limiting: RateLimiting,

    #[serde(default)]
    pub notifications: Notifications,

    #[serde(default)]
    pub persistence: Persistence,
}

/// Persistence health details
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceStatus {
    /// Last successful snapshot write (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_persisted_time: Option<String>,

    /// Entries in the last written snapshot
    #[serde(default)]
    pub persisted_entries: u64,

    /// Failed persist attempts (capped)
    #[serde(default)]
    pub failure_count: u64,

    /// Last persist failure (truncated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,

    /// Persistence is paused until this time after a size-ceiling failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<String>,
}

/// Status of the `RemediationPolicy`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationPolicyStatus {
    #[serde(default)]
    pub total_events_processed: u64,

    #[serde(default)]
    pub successful_remediations: u64,

    #[serde(default)]
    pub failed_remediations: u64,

    #[serde(default)]
    pub rate_limited_events: u64,

    #[serde(default)]
    pub total_mcp_messages_generated: u64,

    /// Most recent error (truncated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Last processed event as `reason Kind/namespace/name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_event: Option<String>,

    /// Time of the last completed remediation (RFC3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remediation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions for the `RemediationPolicy`
    #[serde(default)]
    pub conditions: Vec<PolicyCondition>,
}

/// Condition for the `RemediationPolicy`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition's last transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
