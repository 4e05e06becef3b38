//! Policy status aggregation
//!
//! Every status change for a policy goes through its [`StatusAggregator`].
//! Changes are expressed as a [`StatusDelta`], merged while a write is in
//! flight, and applied with a read-modify-write guarded by the object's
//! `resourceVersion`. Conflicts are retried locally and never reach callers.

use super::error::StatusError;
use super::persistence::PersistReport;
use super::retry::{RetryPolicy, RetryStep};
use crate::crds::{PersistenceStatus, PolicyCondition, RemediationPolicy, RemediationPolicyStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_NOTIFICATIONS: &str = "NotificationsHealthy";
pub const CONDITION_PERSISTENCE: &str = "PersistenceHealthy";

/// Ceilings applied to every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLimits {
    pub counter_ceiling: u64,
    pub last_error_bytes: usize,
}

impl Default for StatusLimits {
    fn default() -> Self {
        Self {
            counter_ceiling: 100_000,
            last_error_bytes: 1024,
        }
    }
}

/// Final result of one event's trip through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted past the cooldown; carries the event description
    Processed(String),
    RateLimited,
    Succeeded { at: DateTime<Utc> },
    Failed { at: DateTime<Utc>, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConditionUpdate {
    condition_type: &'static str,
    healthy: bool,
    reason: String,
    message: String,
}

/// Pending status changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDelta {
    processed: u64,
    succeeded: u64,
    failed: u64,
    rate_limited: u64,
    dispatches: u64,
    last_error: Option<String>,
    last_processed_event: Option<String>,
    last_remediation_time: Option<DateTime<Utc>>,
    persistence: Option<PersistReport>,
    persist_failures: u64,
    conditions: Vec<ConditionUpdate>,
    observed_generation: Option<i64>,
}

impl StatusDelta {
    #[must_use]
    pub fn outcome(outcome: Outcome) -> Self {
        let mut delta = Self::default();
        match outcome {
            Outcome::Processed(event) => {
                delta.processed = 1;
                delta.last_processed_event = Some(event);
            }
            Outcome::RateLimited => delta.rate_limited = 1,
            Outcome::Succeeded { at } => {
                delta.succeeded = 1;
                delta.last_remediation_time = Some(at);
            }
            Outcome::Failed { at, error } => {
                delta.failed = 1;
                delta.last_remediation_time = Some(at);
                delta.last_error = Some(error);
            }
        }
        delta
    }

    #[must_use]
    pub fn dispatch_started() -> Self {
        Self {
            dispatches: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn persistence(report: &PersistReport) -> Self {
        let (healthy, reason, message) = match report {
            PersistReport::Persisted { entries, .. } => {
                (true, "Persisted", format!("{entries} cooldown entries stored"))
            }
            PersistReport::Failed {
                error,
                backoff_until: Some(until),
                ..
            } => (
                false,
                "SnapshotTooLarge",
                format!("{error}; paused until {}", rfc3339(*until)),
            ),
            PersistReport::Failed { error, .. } => (false, "PersistFailed", error.clone()),
        };

        let mut delta = Self::condition(CONDITION_PERSISTENCE, healthy, reason, message);
        delta.persist_failures = u64::from(matches!(report, PersistReport::Failed { .. }));
        delta.persistence = Some(report.clone());
        delta
    }

    #[must_use]
    pub fn condition(
        condition_type: &'static str,
        healthy: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conditions: vec![ConditionUpdate {
                condition_type,
                healthy,
                reason: reason.into(),
                message: message.into(),
            }],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation.or(self.observed_generation);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold `other` in; later values win for the single-valued fields.
    pub fn merge(&mut self, other: Self) {
        self.processed = self.processed.saturating_add(other.processed);
        self.succeeded = self.succeeded.saturating_add(other.succeeded);
        self.failed = self.failed.saturating_add(other.failed);
        self.rate_limited = self.rate_limited.saturating_add(other.rate_limited);
        self.dispatches = self.dispatches.saturating_add(other.dispatches);
        self.persist_failures = self.persist_failures.saturating_add(other.persist_failures);
        self.last_error = other.last_error.or(self.last_error.take());
        self.last_processed_event = other.last_processed_event.or(self.last_processed_event.take());
        self.last_remediation_time = other.last_remediation_time.or(self.last_remediation_time);
        self.persistence = other.persistence.or(self.persistence.take());
        self.observed_generation = other.observed_generation.or(self.observed_generation);
        for update in other.conditions {
            self.conditions
                .retain(|c| c.condition_type != update.condition_type);
            self.conditions.push(update);
        }
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Add `by` without ever exceeding `ceiling` or decreasing.
fn bump(counter: &mut u64, by: u64, ceiling: u64) {
    *counter = (*counter).max(counter.saturating_add(by).min(ceiling));
}

/// Cut `message` to at most `budget` bytes on a char boundary.
#[must_use]
pub fn truncate(message: &str, budget: usize) -> String {
    if message.len() <= budget {
        return message.to_string();
    }
    let mut end = budget;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Upsert a condition; the transition time moves only when the status flips.
pub fn set_condition(
    conditions: &mut Vec<PolicyCondition>,
    condition_type: &str,
    healthy: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let status = if healthy { "True" } else { "False" };

    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != status {
            existing.last_transition_time = Some(rfc3339(now));
        }
        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
        return;
    }

    conditions.push(PolicyCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(rfc3339(now)),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    });
}

/// Apply `delta` onto `status`.
pub fn apply(
    status: &mut RemediationPolicyStatus,
    delta: &StatusDelta,
    limits: StatusLimits,
    now: DateTime<Utc>,
) {
    let ceiling = limits.counter_ceiling;
    bump(&mut status.total_events_processed, delta.processed, ceiling);
    bump(&mut status.successful_remediations, delta.succeeded, ceiling);
    bump(&mut status.failed_remediations, delta.failed, ceiling);
    bump(&mut status.rate_limited_events, delta.rate_limited, ceiling);
    bump(&mut status.total_mcp_messages_generated, delta.dispatches, ceiling);

    if let Some(error) = &delta.last_error {
        status.last_error = Some(truncate(error, limits.last_error_bytes));
    }
    if let Some(event) = &delta.last_processed_event {
        status.last_processed_event = Some(truncate(event, limits.last_error_bytes));
    }
    if let Some(at) = delta.last_remediation_time {
        status.last_remediation_time = Some(rfc3339(at));
    }
    if let Some(generation) = delta.observed_generation {
        status.observed_generation = Some(generation);
    }

    if let Some(report) = &delta.persistence {
        let persistence = status.persistence.get_or_insert_with(PersistenceStatus::default);
        bump(&mut persistence.failure_count, delta.persist_failures, ceiling);
        match report {
            PersistReport::Persisted { at, entries } => {
                persistence.last_persisted_time = Some(rfc3339(*at));
                persistence.persisted_entries = u64::try_from(*entries).unwrap_or(u64::MAX);
                persistence.backoff_until = None;
            }
            PersistReport::Failed {
                error,
                backoff_until,
                ..
            } => {
                persistence.last_failure = Some(truncate(error, limits.last_error_bytes));
                persistence.backoff_until = backoff_until.map(rfc3339);
            }
        }
    }

    for update in &delta.conditions {
        set_condition(
            &mut status.conditions,
            update.condition_type,
            update.healthy,
            &update.reason,
            &truncate(&update.message, limits.last_error_bytes),
            now,
        );
    }
}

/// Read and write access to one policy's status.
#[async_trait]
pub trait PolicyStatusApi: Send + Sync {
    /// Current status and `resourceVersion`, `None` when the policy is gone
    async fn fetch(&self) -> Result<Option<(RemediationPolicyStatus, Option<String>)>, kube::Error>;

    /// Write `status`, failing with 409 when `resource_version` is stale
    async fn write(
        &self,
        resource_version: Option<&str>,
        status: &RemediationPolicyStatus,
    ) -> Result<(), kube::Error>;
}

/// `PolicyStatusApi` over the status subresource.
pub struct KubePolicyStatusApi {
    api: Api<RemediationPolicy>,
    name: String,
}

impl KubePolicyStatusApi {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl PolicyStatusApi for KubePolicyStatusApi {
    async fn fetch(&self) -> Result<Option<(RemediationPolicyStatus, Option<String>)>, kube::Error> {
        Ok(self.api.get_opt(&self.name).await?.map(|policy| {
            (
                policy.status.unwrap_or_default(),
                policy.metadata.resource_version,
            )
        }))
    }

    async fn write(
        &self,
        resource_version: Option<&str>,
        status: &RemediationPolicyStatus,
    ) -> Result<(), kube::Error> {
        let mut status_value = serde_json::to_value(status).map_err(kube::Error::SerdeError)?;
        // Merge patches keep omitted keys; clear a lifted backoff explicitly
        if let Some(persistence) = status_value
            .get_mut("persistence")
            .and_then(serde_json::Value::as_object_mut)
        {
            persistence
                .entry("backoffUntil")
                .or_insert(serde_json::Value::Null);
        }

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status_value
        });
        self.api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn conflict() -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    })
}

/// Process-local status subresource for tests and dry runs. Honors
/// `resourceVersion` preconditions and can inject conflicts.
#[derive(Default)]
pub struct InMemoryPolicyStatus {
    state: Mutex<(RemediationPolicyStatus, u64)>,
    conflicts: AtomicU32,
    writes: AtomicU32,
}

impl InMemoryPolicyStatus {
    /// Fail the next `n` writes with 409.
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn status(&self) -> RemediationPolicyStatus {
        self.state.lock().map(|s| s.0.clone()).unwrap_or_default()
    }

    /// Successful writes so far
    #[must_use]
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyStatusApi for Arc<InMemoryPolicyStatus> {
    async fn fetch(&self) -> Result<Option<(RemediationPolicyStatus, Option<String>)>, kube::Error> {
        Ok(self
            .state
            .lock()
            .ok()
            .map(|state| (state.0.clone(), Some(state.1.to_string()))))
    }

    async fn write(
        &self,
        resource_version: Option<&str>,
        status: &RemediationPolicyStatus,
    ) -> Result<(), kube::Error> {
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(conflict());
        }
        let Ok(mut state) = self.state.lock() else {
            return Err(conflict());
        };
        if resource_version != Some(state.1.to_string().as_str()) {
            return Err(conflict());
        }
        state.0 = status.clone();
        state.1 += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// Single writer of one policy's status.
pub struct StatusAggregator {
    api: Box<dyn PolicyStatusApi>,
    limits: StatusLimits,
    conflict_retry: RetryPolicy,
    pending: Mutex<StatusDelta>,
    flush: tokio::sync::Mutex<()>,
}

impl StatusAggregator {
    pub fn new(api: impl PolicyStatusApi + 'static, limits: StatusLimits, conflict_retries: u32) -> Self {
        Self {
            api: Box::new(api),
            limits,
            conflict_retry: RetryPolicy {
                max_attempts: conflict_retries.max(1),
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(1),
                jitter: true,
            },
            pending: Mutex::new(StatusDelta::default()),
            flush: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn record_outcome(&self, outcome: Outcome) {
        self.record(StatusDelta::outcome(outcome)).await;
    }

    pub async fn record_dispatch_started(&self) {
        self.record(StatusDelta::dispatch_started()).await;
    }

    pub async fn record_persistence(&self, report: &PersistReport) {
        self.record(StatusDelta::persistence(report)).await;
    }

    pub async fn set_condition(
        &self,
        condition_type: &'static str,
        healthy: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.record(StatusDelta::condition(condition_type, healthy, reason, message))
            .await;
    }

    /// Queue `delta` and flush. Deltas queued while another flush runs are
    /// written together by the next one.
    pub async fn record(&self, delta: StatusDelta) {
        self.queue(delta);

        let _flushing = self.flush.lock().await;
        let delta = self.take_pending();
        if delta.is_empty() {
            return;
        }

        match self.write(&delta).await {
            Ok(()) => {}
            Err(StatusError::PolicyGone) => {
                debug!("Dropping status update for deleted policy");
            }
            Err(e) => {
                warn!(error = %e, "Status update failed, keeping it for the next write");
                self.requeue_failed(delta);
            }
        }
    }

    fn queue(&self, delta: StatusDelta) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.merge(delta);
        }
    }

    /// Put a failed delta back underneath anything queued since it was taken.
    fn requeue_failed(&self, mut failed: StatusDelta) {
        failed.merge(self.take_pending());
        self.queue(failed);
    }

    fn take_pending(&self) -> StatusDelta {
        self.pending
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending))
            .unwrap_or_default()
    }

    /// Read-modify-write with conflict retries.
    pub async fn write(&self, delta: &StatusDelta) -> Result<(), StatusError> {
        let mut backoff = self.conflict_retry.start();

        loop {
            let Some((mut status, resource_version)) = self.api.fetch().await? else {
                return Err(StatusError::PolicyGone);
            };

            apply(&mut status, delta, self.limits, Utc::now());

            match self.api.write(resource_version.as_deref(), &status).await {
                Ok(()) => return Ok(()),
                Err(e) if is_conflict(&e) => match backoff.on_failure(true) {
                    RetryStep::RetryAfter { delay, attempt } => {
                        debug!(attempt, delay_ms = delay.as_millis(), "Status conflict, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    RetryStep::GiveUp => {
                        return Err(StatusError::ConflictRetriesExhausted(backoff.attempt()));
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap()
    }

    fn aggregator(api: &Arc<InMemoryPolicyStatus>, retries: u32) -> StatusAggregator {
        StatusAggregator::new(Arc::clone(api), StatusLimits::default(), retries)
    }

    #[test]
    fn each_outcome_bumps_one_counter() {
        let mut status = RemediationPolicyStatus::default();
        let limits = StatusLimits::default();

        apply(&mut status, &StatusDelta::outcome(Outcome::Processed("BackOff Pod/a/b".into())), limits, at(0));
        apply(&mut status, &StatusDelta::outcome(Outcome::RateLimited), limits, at(0));
        apply(&mut status, &StatusDelta::outcome(Outcome::Succeeded { at: at(1) }), limits, at(1));
        apply(&mut status, &StatusDelta::dispatch_started(), limits, at(1));

        assert_eq!(status.total_events_processed, 1);
        assert_eq!(status.rate_limited_events, 1);
        assert_eq!(status.successful_remediations, 1);
        assert_eq!(status.failed_remediations, 0);
        assert_eq!(status.total_mcp_messages_generated, 1);
        assert_eq!(status.last_processed_event.as_deref(), Some("BackOff Pod/a/b"));
        assert_eq!(status.last_remediation_time.as_deref(), Some("2025-03-01T12:01:00Z"));
    }

    #[test]
    fn counters_are_monotone_and_capped() {
        let limits = StatusLimits {
            counter_ceiling: 10,
            last_error_bytes: 64,
        };
        let mut status = RemediationPolicyStatus::default();
        let mut previous = 0;
        for _ in 0..25 {
            apply(&mut status, &StatusDelta::outcome(Outcome::RateLimited), limits, at(0));
            assert!(status.rate_limited_events >= previous);
            assert!(status.rate_limited_events <= 10);
            previous = status.rate_limited_events;
        }
        assert_eq!(status.rate_limited_events, 10);

        // a counter already above a lowered ceiling is never decreased
        status.failed_remediations = 50;
        apply(
            &mut status,
            &StatusDelta::outcome(Outcome::Failed { at: at(0), error: "x".into() }),
            limits,
            at(0),
        );
        assert_eq!(status.failed_remediations, 50);

        let mut counter = u64::MAX - 1;
        bump(&mut counter, 5, u64::MAX);
        assert_eq!(counter, u64::MAX);
    }

    #[test]
    fn truncation_respects_budget_and_char_boundaries() {
        let long = "é".repeat(600);
        for budget in [0, 1, 2, 3, 1023, 1024] {
            let cut = truncate(&long, budget);
            assert!(cut.len() <= budget, "{} > {budget}", cut.len());
            assert!(long.starts_with(&cut));
        }
        assert_eq!(truncate("short", 1024), "short");

        let mut status = RemediationPolicyStatus::default();
        let delta = StatusDelta::outcome(Outcome::Failed {
            at: at(0),
            error: "x".repeat(5000),
        });
        apply(&mut status, &delta, StatusLimits::default(), at(0));
        assert_eq!(status.last_error.map(|e| e.len()), Some(1024));
    }

    #[test]
    fn transition_time_moves_only_on_flip() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_READY, true, "Valid", "ok", at(0));
        set_condition(&mut conditions, CONDITION_READY, true, "Valid", "still ok", at(5));
        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2025-03-01T12:00:00Z")
        );
        assert_eq!(conditions[0].message.as_deref(), Some("still ok"));

        set_condition(&mut conditions, CONDITION_READY, false, "Invalid", "bad", at(7));
        assert_eq!(conditions[0].status, "False");
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2025-03-01T12:07:00Z")
        );
    }

    #[test]
    fn persistence_reports_update_status() {
        let mut status = RemediationPolicyStatus::default();
        let limits = StatusLimits::default();

        let failed = PersistReport::Failed {
            at: at(0),
            error: "too large".into(),
            backoff_until: Some(at(5)),
        };
        apply(&mut status, &StatusDelta::persistence(&failed), limits, at(0));
        let persistence = status.persistence.clone().unwrap();
        assert_eq!(persistence.failure_count, 1);
        assert_eq!(persistence.backoff_until.as_deref(), Some("2025-03-01T12:05:00Z"));
        assert_eq!(status.conditions[0].reason.as_deref(), Some("SnapshotTooLarge"));
        assert_eq!(status.conditions[0].status, "False");

        let ok = PersistReport::Persisted { at: at(6), entries: 3 };
        apply(&mut status, &StatusDelta::persistence(&ok), limits, at(6));
        let persistence = status.persistence.unwrap();
        assert_eq!(persistence.persisted_entries, 3);
        assert_eq!(persistence.failure_count, 1);
        assert_eq!(persistence.backoff_until, None);
        assert_eq!(status.conditions[0].status, "True");
    }

    #[test]
    fn merge_sums_counters_and_keeps_latest_condition() {
        let mut delta = StatusDelta::outcome(Outcome::RateLimited);
        delta.merge(StatusDelta::outcome(Outcome::RateLimited));
        delta.merge(StatusDelta::condition(CONDITION_NOTIFICATIONS, false, "SecretNotFound", "x"));
        delta.merge(StatusDelta::condition(CONDITION_NOTIFICATIONS, true, "Resolved", "y"));

        let mut status = RemediationPolicyStatus::default();
        apply(&mut status, &delta, StatusLimits::default(), at(0));
        assert_eq!(status.rate_limited_events, 2);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "True");
    }

    #[tokio::test]
    async fn conflicts_are_retried_transparently() {
        let api = Arc::new(InMemoryPolicyStatus::default());
        api.inject_conflicts(3);
        let aggregator = aggregator(&api, 5);

        aggregator.record_outcome(Outcome::RateLimited).await;

        assert_eq!(api.writes(), 1);
        assert_eq!(api.status().rate_limited_events, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_delta_for_next_write() {
        let api = Arc::new(InMemoryPolicyStatus::default());
        api.inject_conflicts(2);
        let aggregator = aggregator(&api, 2);

        let err = aggregator
            .write(&StatusDelta::outcome(Outcome::RateLimited))
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::ConflictRetriesExhausted(2)));

        api.inject_conflicts(2);
        aggregator.record_outcome(Outcome::RateLimited).await;
        assert_eq!(api.writes(), 0);

        // the failed delta rides along with the next successful write
        aggregator.record_dispatch_started().await;
        let status = api.status();
        assert_eq!(status.rate_limited_events, 1);
        assert_eq!(status.total_mcp_messages_generated, 1);
    }

    #[tokio::test]
    async fn concurrent_records_are_not_lost() {
        let api = Arc::new(InMemoryPolicyStatus::default());
        let aggregator = Arc::new(aggregator(&api, 5));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                tokio::spawn(async move { aggregator.record_outcome(Outcome::RateLimited).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(api.status().rate_limited_events, 20);
    }

    #[test]
    fn failed_delta_does_not_overwrite_newer_pending_values() {
        let api = Arc::new(InMemoryPolicyStatus::default());
        let aggregator = aggregator(&api, 1);

        let mut older = StatusDelta::outcome(Outcome::Failed {
            at: at(0),
            error: "backend returned HTTP 503".into(),
        });
        older.merge(StatusDelta::condition(CONDITION_READY, false, "SecretNotFound", "x"));
        let mut newer = StatusDelta::outcome(Outcome::Failed {
            at: at(1),
            error: "request timed out after 30s".into(),
        });
        newer.merge(StatusDelta::condition(CONDITION_READY, true, "Registered", "y"));

        aggregator.queue(newer);
        aggregator.requeue_failed(older);

        let mut status = RemediationPolicyStatus::default();
        apply(&mut status, &aggregator.take_pending(), StatusLimits::default(), at(1));
        assert_eq!(status.failed_remediations, 2);
        assert_eq!(status.last_error.as_deref(), Some("request timed out after 30s"));
        assert_eq!(status.last_remediation_time.as_deref(), Some("2025-03-01T12:01:00Z"));
        assert_eq!(status.conditions[0].reason.as_deref(), Some("Registered"));
    }
}
