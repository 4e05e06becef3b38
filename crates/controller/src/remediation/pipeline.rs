//! Per-policy event pipeline
//!
//! match -> dedup -> owner resolution -> cooldown -> dispatch -> notify, with
//! every outcome reported to the policy's status aggregator.

use super::cooldown::{CooldownStore, FireDecision};
use super::dedup::EventDeduplicator;
use super::dispatcher::{RemediationDispatcher, RemediationRequest};
use super::event::ClusterEvent;
use super::key::RateLimitKey;
use super::notifications::{resolve_secret_value, PolicyNotifications, SecretLookup};
use super::owner::{OwnerLookup, OwnerResolver};
use super::selector::{match_event, SelectorMatch};
use super::status::{Outcome, StatusAggregator};
use crate::crds::RemediationPolicySpec;
use chrono::{DateTime, Utc};
use notify::{EventSummary, NotifyEvent};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything the pipeline needs to know about one registered policy.
pub struct PolicyRuntime {
    pub namespace: String,
    pub name: String,
    pub generation: Option<i64>,
    pub spec: RemediationPolicySpec,
    pub cooldowns: Arc<CooldownStore>,
    pub status: Arc<StatusAggregator>,
    pub notifications: PolicyNotifications,
}

impl PolicyRuntime {
    /// `namespace/name`
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// What happened to one event under one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Older than the configured maximum age
    Stale,
    NoMatch,
    Duplicate,
    /// Refused by the per-minute budget or the cooldown
    RateLimited { key: RateLimitKey },
    Remediated { key: RateLimitKey, success: bool },
}

/// Shared, policy-independent parts of the pipeline.
pub struct Pipeline<O, S> {
    resolver: OwnerResolver<O>,
    secrets: S,
    dispatcher: RemediationDispatcher,
    dedup: EventDeduplicator,
    max_event_age: Option<chrono::Duration>,
}

impl<O: OwnerLookup, S: SecretLookup> Pipeline<O, S> {
    pub fn new(
        owners: O,
        secrets: S,
        dispatcher: RemediationDispatcher,
        dedup: EventDeduplicator,
        max_event_age: Option<chrono::Duration>,
    ) -> Self {
        Self {
            resolver: OwnerResolver::new(owners),
            secrets,
            dispatcher,
            dedup,
            max_event_age,
        }
    }

    fn is_stale(&self, event: &ClusterEvent, now: DateTime<Utc>) -> bool {
        match (self.max_event_age, event.last_observed) {
            (Some(max_age), Some(observed)) => now - observed > max_age,
            _ => false,
        }
    }

    /// Run one event through one policy.
    pub async fn process(&self, policy: &PolicyRuntime, event: &ClusterEvent) -> Disposition {
        if self.is_stale(event, Utc::now()) {
            debug!(event = %event.describe(), "Skipping stale event");
            return Disposition::Stale;
        }

        let Some(matched) = match_event(&policy.spec, event) else {
            return Disposition::NoMatch;
        };

        let token = format!("{}|{}", policy.id(), event.uniqueness_token());
        if !self.dedup.first_sighting(&token) {
            debug!(policy = %policy.id(), event = %event.describe(), "Duplicate event");
            return Disposition::Duplicate;
        }

        let owner = self.resolver.resolve(&event.involved_object).await;
        let key = RateLimitKey::new(
            &policy.namespace,
            &policy.name,
            &event.involved_object.namespace,
            &owner,
            &event.reason,
        );

        let rate_limiting = &policy.spec.rate_limiting;
        match policy
            .cooldowns
            .admit(&key, rate_limiting.cooldown(), rate_limiting.events_per_minute)
        {
            FireDecision::Allowed => {}
            decision => {
                debug!(policy = %policy.id(), key = %key, ?decision, "Event rate limited");
                policy.status.record_outcome(Outcome::RateLimited).await;
                return Disposition::RateLimited { key };
            }
        }

        info!(
            policy = %policy.id(),
            selector = matched.index,
            key = %key,
            mode = %matched.settings.mode,
            event = %event.describe(),
            "Dispatching remediation"
        );
        policy
            .status
            .record_outcome(Outcome::Processed(event.describe()))
            .await;

        let success = self.remediate(policy, event, &matched).await;
        Disposition::Remediated { key, success }
    }

    async fn remediate(&self, policy: &PolicyRuntime, event: &ClusterEvent, matched: &SelectorMatch<'_>) -> bool {
        let started = Instant::now();
        let summary = EventSummary {
            event_type: event.event_type.clone(),
            reason: event.reason.clone(),
            object: event.involved_object.to_string(),
            message: (!event.message.is_empty()).then(|| event.message.clone()),
        };
        let mode = matched.settings.mode.to_string();

        let token = match &policy.spec.auth_secret_ref {
            Some(secret_ref) => {
                match resolve_secret_value(&self.secrets, &policy.namespace, secret_ref).await {
                    Ok(token) => Some(token),
                    Err(e) => {
                        warn!(policy = %policy.id(), error = %e, "Backend credential unavailable");
                        policy
                            .status
                            .record_outcome(Outcome::Failed {
                                at: Utc::now(),
                                error: format!("credential unavailable: {e}"),
                            })
                            .await;
                        return false;
                    }
                }
            }
            None => None,
        };

        let request = RemediationRequest::build(event, &matched.settings);
        policy.status.record_dispatch_started().await;
        policy.notifications.send(
            NotifyEvent::RemediationStarted {
                policy: policy.name.clone(),
                namespace: policy.namespace.clone(),
                mode: mode.clone(),
                event: summary.clone(),
                timestamp: Utc::now(),
            },
            Some(Arc::clone(&policy.status)),
        );

        let result = self
            .dispatcher
            .dispatch(&policy.spec.remediation_endpoint, token.as_deref(), &request)
            .await;
        let finished = Utc::now();
        let duration_secs = started.elapsed().as_secs();

        let (success, message, actions_taken) = match result {
            Ok(response) => {
                info!(
                    policy = %policy.id(),
                    actions = response.actions_taken.len(),
                    duration_secs,
                    "Remediation succeeded"
                );
                policy
                    .status
                    .record_outcome(Outcome::Succeeded { at: finished })
                    .await;
                let message = response
                    .message
                    .unwrap_or_else(|| "remediation completed".to_string());
                (true, message, response.actions_taken)
            }
            Err(e) => {
                warn!(policy = %policy.id(), error = %e, duration_secs, "Remediation failed");
                policy
                    .status
                    .record_outcome(Outcome::Failed {
                        at: finished,
                        error: e.to_string(),
                    })
                    .await;
                (false, e.to_string(), Vec::new())
            }
        };

        policy.notifications.send(
            NotifyEvent::RemediationCompleted {
                policy: policy.name.clone(),
                namespace: policy.namespace.clone(),
                mode,
                event: summary,
                success,
                message,
                actions_taken,
                duration_secs,
                timestamp: finished,
            },
            Some(Arc::clone(&policy.status)),
        );

        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{EventSelector, RateLimiting, RemediationMode, SecretKeyRef};
    use crate::remediation::event::InvolvedObject;
    use crate::remediation::notifications::MockSecretLookup;
    use crate::remediation::owner::{Lookup, MockOwnerLookup};
    use crate::remediation::retry::RetryPolicy;
    use crate::remediation::status::{InMemoryPolicyStatus, StatusLimits};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(owners: MockOwnerLookup, secrets: MockSecretLookup) -> Pipeline<MockOwnerLookup, MockSecretLookup> {
        let dispatcher = RemediationDispatcher::new(
            reqwest::Client::new(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            Duration::from_secs(5),
        );
        Pipeline::new(
            owners,
            secrets,
            dispatcher,
            EventDeduplicator::new(Duration::from_secs(600), 1000),
            Some(chrono::Duration::hours(1)),
        )
    }

    fn runtime(endpoint: String, selectors: Vec<EventSelector>) -> (PolicyRuntime, Arc<InMemoryPolicyStatus>) {
        let status_api = Arc::new(InMemoryPolicyStatus::default());
        let runtime = PolicyRuntime {
            namespace: "ops".to_string(),
            name: "batch-failures".to_string(),
            generation: Some(1),
            spec: RemediationPolicySpec {
                event_selectors: selectors,
                remediation_endpoint: endpoint,
                auth_secret_ref: None,
                mode: RemediationMode::Manual,
                confidence_threshold: 0.8,
                max_risk_level: crate::crds::RiskLevel::Low,
                rate_limiting: RateLimiting {
                    events_per_minute: 10,
                    cooldown_minutes: 15,
                },
                notifications: Default::default(),
                persistence: Default::default(),
            },
            cooldowns: Arc::new(CooldownStore::new()),
            status: Arc::new(StatusAggregator::new(Arc::clone(&status_api), StatusLimits::default(), 5)),
            notifications: PolicyNotifications::default(),
        };
        (runtime, status_api)
    }

    fn pod_event(pod: &str, observed_secs_ago: i64) -> ClusterEvent {
        ClusterEvent {
            name: format!("{pod}.17a2"),
            namespace: "batch".to_string(),
            uid: Some(format!("uid-{pod}")),
            event_type: "Warning".to_string(),
            reason: "BackOff".to_string(),
            message: "Back-off restarting failed container".to_string(),
            involved_object: InvolvedObject {
                kind: "Pod".to_string(),
                name: pod.to_string(),
                namespace: "batch".to_string(),
                uid: None,
            },
            last_observed: Some(Utc::now() - chrono::Duration::seconds(observed_secs_ago)),
            count: 1,
            ..Default::default()
        }
    }

    fn backoff_selector() -> EventSelector {
        EventSelector {
            event_type: Some("Warning".to_string()),
            reason: Some("BackOff".to_string()),
            involved_object_kind: Some("Pod".to_string()),
            mode: Some(RemediationMode::Automatic),
            ..Default::default()
        }
    }

    async fn backend(expected_calls: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"mode": "automatic", "maxRiskLevel": "low"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "actionsTaken": ["restarted job"]
            })))
            .expect(expected_calls)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn pods_of_one_cronjob_share_a_cooldown() {
        let server = backend(1).await;
        let mut owners = MockOwnerLookup::new();
        owners.expect_controller_of().returning(|_, _, _| Ok(Lookup::NotFound));
        let pipeline = pipeline(owners, MockSecretLookup::new());
        let (policy, status) = runtime(server.uri(), vec![backoff_selector()]);

        let first = pipeline
            .process(&policy, &pod_event("nightly-backup-29409620-abc12", 120))
            .await;
        let second = pipeline
            .process(&policy, &pod_event("nightly-backup-29409621-def34", 0))
            .await;

        let key = RateLimitKey::from("ops/batch-failures/batch/cronjob:nightly-backup/BackOff");
        assert_eq!(first, Disposition::Remediated { key: key.clone(), success: true });
        assert_eq!(second, Disposition::RateLimited { key });

        let status = status.status();
        assert_eq!(status.total_events_processed, 1);
        assert_eq!(status.successful_remediations, 1);
        assert_eq!(status.rate_limited_events, 1);
        assert_eq!(status.total_mcp_messages_generated, 1);
        assert!(policy.cooldowns.is_dirty());
    }

    #[tokio::test]
    async fn replayed_event_is_dropped() {
        let server = backend(1).await;
        let mut owners = MockOwnerLookup::new();
        owners
            .expect_controller_of()
            .times(1)
            .returning(|_, _, _| Ok(Lookup::Found(None)));
        let pipeline = pipeline(owners, MockSecretLookup::new());
        let (policy, _) = runtime(server.uri(), vec![backoff_selector()]);

        let event = pod_event("web-0", 10);
        assert!(matches!(pipeline.process(&policy, &event).await, Disposition::Remediated { .. }));
        assert_eq!(pipeline.process(&policy, &event).await, Disposition::Duplicate);
    }

    #[tokio::test]
    async fn unmatched_and_stale_events_are_skipped() {
        let mut owners = MockOwnerLookup::new();
        owners.expect_controller_of().never();
        let pipeline = pipeline(owners, MockSecretLookup::new());
        let (policy, status) = runtime("http://127.0.0.1:9".to_string(), vec![backoff_selector()]);

        let mut normal = pod_event("web-0", 0);
        normal.event_type = "Normal".to_string();
        assert_eq!(pipeline.process(&policy, &normal).await, Disposition::NoMatch);

        let old = pod_event("web-1", 2 * 3600);
        assert_eq!(pipeline.process(&policy, &old).await, Disposition::Stale);
        assert_eq!(status.writes(), 0);
    }

    #[tokio::test]
    async fn bearer_token_comes_from_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer backend-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let mut owners = MockOwnerLookup::new();
        owners.expect_controller_of().returning(|_, _, _| Ok(Lookup::Found(None)));
        let mut secrets = MockSecretLookup::new();
        secrets.expect_secret_data().returning(|_, _| {
            Ok(Some(BTreeMap::from([(
                "token".to_string(),
                b"backend-token".to_vec(),
            )])))
        });

        let pipeline = pipeline(owners, secrets);
        let (mut policy, _) = runtime(server.uri(), vec![backoff_selector()]);
        policy.spec.auth_secret_ref = Some(SecretKeyRef {
            name: "backend-auth".to_string(),
            key: "token".to_string(),
        });

        let disposition = pipeline.process(&policy, &pod_event("web-0", 0)).await;
        assert!(matches!(disposition, Disposition::Remediated { success: true, .. }));
    }

    #[tokio::test]
    async fn missing_credential_counts_as_failure() {
        let mut owners = MockOwnerLookup::new();
        owners.expect_controller_of().returning(|_, _, _| Ok(Lookup::Found(None)));
        let mut secrets = MockSecretLookup::new();
        secrets.expect_secret_data().returning(|_, _| Ok(None));

        let pipeline = pipeline(owners, secrets);
        let (mut policy, status) = runtime("http://127.0.0.1:9".to_string(), vec![backoff_selector()]);
        policy.spec.auth_secret_ref = Some(SecretKeyRef {
            name: "backend-auth".to_string(),
            key: "token".to_string(),
        });

        let disposition = pipeline.process(&policy, &pod_event("web-0", 0)).await;
        assert!(matches!(disposition, Disposition::Remediated { success: false, .. }));

        let status = status.status();
        assert_eq!(status.failed_remediations, 1);
        assert_eq!(status.total_mcp_messages_generated, 0);
        assert!(status.last_error.unwrap().contains("backend-auth"));
    }
}
