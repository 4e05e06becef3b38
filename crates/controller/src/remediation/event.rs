//! Normalized view of a `v1/Event` as seen by the pipeline

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use kube::ResourceExt;
use std::fmt;

/// Reference to the object an event is about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvolvedObject {
    pub kind: String,
    pub name: String,
    /// Empty for cluster-scoped objects
    pub namespace: String,
    pub uid: Option<String>,
}

impl fmt::Display for InvolvedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// An observed cluster occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterEvent {
    /// Name of the Event object
    pub name: String,
    /// Namespace of the Event object
    pub namespace: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// `Warning` or `Normal`
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub involved_object: InvolvedObject,
    /// Most recent time the occurrence was observed
    pub last_observed: Option<DateTime<Utc>>,
    /// Series or legacy repeat count
    pub count: i32,
}

impl ClusterEvent {
    /// Identity plus last-observed time.
    ///
    /// A repeated event keeps its uid but moves its last-observed time, so
    /// every recurrence yields a fresh token; an unchanged resync yields the
    /// same one.
    #[must_use]
    pub fn uniqueness_token(&self) -> String {
        let identity = self
            .uid
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.namespace, self.name));
        let observed = self
            .last_observed
            .map(|t| t.to_rfc3339())
            .or_else(|| self.resource_version.clone())
            .unwrap_or_default();
        format!("{identity}@{observed}")
    }

    /// `reason Kind/namespace/name`, used in status and logs
    #[must_use]
    pub fn describe(&self) -> String {
        format!("{} {}", self.reason, self.involved_object)
    }
}

impl From<&Event> for ClusterEvent {
    fn from(event: &Event) -> Self {
        let involved = &event.involved_object;

        // Newer events report through series/eventTime, legacy ones through
        // lastTimestamp; creation time is the last resort.
        let last_observed = event
            .series
            .as_ref()
            .and_then(|s| s.last_observed_time.as_ref())
            .map(|t| t.0)
            .or_else(|| event.last_timestamp.as_ref().map(|t| t.0))
            .or_else(|| event.event_time.as_ref().map(|t| t.0))
            .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0));

        let count = event
            .series
            .as_ref()
            .and_then(|s| s.count)
            .or(event.count)
            .unwrap_or(1);

        Self {
            name: event.name_any(),
            namespace: event.namespace().unwrap_or_default(),
            uid: event.metadata.uid.clone(),
            resource_version: event.metadata.resource_version.clone(),
            event_type: event.type_.clone().unwrap_or_default(),
            reason: event.reason.clone().unwrap_or_default(),
            message: event.message.clone().unwrap_or_default(),
            involved_object: InvolvedObject {
                kind: involved.kind.clone().unwrap_or_default(),
                name: involved.name.clone().unwrap_or_default(),
                namespace: involved.namespace.clone().unwrap_or_default(),
                uid: involved.uid.clone(),
            },
            last_observed,
            count,
        }
    }
}
