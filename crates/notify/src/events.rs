//! Notification event types for remediation lifecycle messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the hex color used by attachment-style payloads.
    #[must_use]
    pub const fn hex_color(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",     // Blue
            Self::Warning => "#f39c12",  // Orange
            Self::Critical => "#e74c3c", // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// The cluster event a remediation was triggered by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    /// Event type (`Warning` or `Normal`)
    pub event_type: String,
    /// Event reason (e.g. `FailedScheduling`)
    pub reason: String,
    /// Involved object as `Kind/namespace/name`
    pub object: String,
    /// Event message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A remediation request was sent to the backend
    RemediationStarted {
        policy: String,
        namespace: String,
        mode: String,
        event: EventSummary,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The backend finished (or the dispatcher gave up)
    RemediationCompleted {
        policy: String,
        namespace: String,
        mode: String,
        event: EventSummary,
        success: bool,
        message: String,
        #[serde(default)]
        actions_taken: Vec<String>,
        duration_secs: u64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::RemediationStarted { event, .. } => {
                format!("Remediation Started: {} on {}", event.reason, event.object)
            }
            Self::RemediationCompleted { event, success, .. } => {
                let status = if *success { "Succeeded" } else { "Failed" };
                format!("Remediation {status}: {} on {}", event.reason, event.object)
            }
        }
    }

    /// Get the severity for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::RemediationStarted { .. } => Severity::Info,
            Self::RemediationCompleted { success, .. } => {
                if *success {
                    Severity::Info
                } else {
                    Severity::Critical
                }
            }
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RemediationStarted { timestamp, .. }
            | Self::RemediationCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Human-readable body shared by all channels.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::RemediationStarted { mode, event, .. } => {
                let mut text = format!(
                    "Analyzing `{}` ({}) in *{mode}* mode",
                    event.object, event.reason
                );
                if let Some(message) = event.message.as_deref().filter(|m| !m.is_empty()) {
                    text.push_str(&format!("\n> {message}"));
                }
                text
            }
            Self::RemediationCompleted {
                success,
                message,
                actions_taken,
                duration_secs,
                ..
            } => {
                let status = if *success {
                    "✅ Success"
                } else {
                    "❌ Failed"
                };
                let mut text = format!("{status} in {}", format_duration(*duration_secs));
                if !message.is_empty() {
                    text.push_str(&format!("\n{message}"));
                }
                if !actions_taken.is_empty() {
                    text.push_str("\n*Actions taken:*");
                    for action in actions_taken {
                        text.push_str(&format!("\n• {action}"));
                    }
                }
                text
            }
        }
    }

    /// Key/value fields shown next to the description.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, String)> {
        match self {
            Self::RemediationStarted {
                policy,
                namespace,
                mode,
                event,
                ..
            }
            | Self::RemediationCompleted {
                policy,
                namespace,
                mode,
                event,
                ..
            } => vec![
                ("Policy".to_string(), format!("{namespace}/{policy}")),
                ("Mode".to_string(), mode.clone()),
                ("Event Type".to_string(), event.event_type.clone()),
                ("Reason".to_string(), event.reason.clone()),
            ],
        }
    }
}

/// Format seconds into a human-readable duration.
#[must_use]
pub fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let remaining_secs = secs % 60;
        if remaining_secs == 0 {
            format!("{mins}m")
        } else {
            format!("{mins}m {remaining_secs}s")
        }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins == 0 {
            format!("{hours}h")
        } else {
            format!("{hours}h {mins}m")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> EventSummary {
        EventSummary {
            event_type: "Warning".to_string(),
            reason: "BackOff".to_string(),
            object: "Pod/prod/api-7d9f".to_string(),
            message: Some("Back-off restarting failed container".to_string()),
        }
    }

    #[test]
    fn completed_failure_is_critical() {
        let event = NotifyEvent::RemediationCompleted {
            policy: "default".to_string(),
            namespace: "ops".to_string(),
            mode: "manual".to_string(),
            event: summary(),
            success: false,
            message: "backend unavailable".to_string(),
            actions_taken: vec![],
            duration_secs: 12,
            timestamp: Utc::now(),
        };
        assert_eq!(event.severity(), Severity::Critical);
        assert_eq!(event.title(), "Remediation Failed: BackOff on Pod/prod/api-7d9f");
        assert!(event.description().contains("❌ Failed in 12s"));
    }

    #[test]
    fn completed_description_lists_actions() {
        let event = NotifyEvent::RemediationCompleted {
            policy: "default".to_string(),
            namespace: "ops".to_string(),
            mode: "automatic".to_string(),
            event: summary(),
            success: true,
            message: "Raised memory limit".to_string(),
            actions_taken: vec!["kubectl patch deployment api".to_string()],
            duration_secs: 95,
            timestamp: Utc::now(),
        };
        let text = event.description();
        assert!(text.contains("1m 35s"));
        assert!(text.contains("• kubectl patch deployment api"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(120), "2m");
        assert_eq!(format_duration(3660), "1h 1m");
        assert_eq!(format_duration(7200), "2h");
    }
}
