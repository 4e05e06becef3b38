//! `RemediationPolicy` reconciliation
//!
//! Turns each valid policy into a [`PolicyRuntime`] in the shared registry,
//! starts its cooldown persistence task, and reports readiness through the
//! policy's status conditions. Invalid policies, and policies whose backend
//! credential cannot be read, are marked `Ready=False` and receive no events.

use super::registry::PersistenceTask;
use super::types::{Context, Error, Result, POLICY_FINALIZER_NAME};
use crate::crds::{RemediationPolicy, RemediationPolicySpec};
use crate::remediation::status::{CONDITION_NOTIFICATIONS, CONDITION_PERSISTENCE, CONDITION_READY};
use crate::remediation::notifications::resolve_secret_value;
use crate::remediation::{
    ConfigMapSnapshotBackend, CooldownStore, KubePolicyStatusApi, KubeSecretLookup, Persister,
    PolicyNotifications, PolicyRuntime, ResolveError, SecretLookup, StatusAggregator, StatusDelta,
    ValidationError,
};
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Periodic resync for registered policies
pub const POLICY_REQUEUE: Duration = Duration::from_secs(5 * 60);

const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Reject policies that can never match or never dispatch.
pub fn validate_policy(spec: &RemediationPolicySpec) -> Result<(), ValidationError> {
    if spec.event_selectors.is_empty() {
        return Err(ValidationError::NoSelectors);
    }

    for (index, selector) in spec.event_selectors.iter().enumerate() {
        if let Some(event_type) = selector.event_type.as_deref() {
            if !event_type.is_empty() && event_type != "Warning" && event_type != "Normal" {
                return Err(ValidationError::InvalidEventType {
                    index,
                    value: event_type.to_string(),
                });
            }
        }
        if let Some(value) = selector.confidence_threshold {
            check_confidence(format!("eventSelectors[{index}].confidenceThreshold"), value)?;
        }
    }

    check_confidence("confidenceThreshold".to_string(), spec.confidence_threshold)?;

    let endpoint = spec.remediation_endpoint.trim();
    if endpoint.is_empty() {
        return Err(ValidationError::EmptyField {
            field: "remediationEndpoint".to_string(),
        });
    }
    match reqwest::Url::parse(endpoint) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {}
        _ => return Err(ValidationError::InvalidEndpoint(endpoint.to_string())),
    }

    if let Some(secret_ref) = &spec.auth_secret_ref {
        if secret_ref.name.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "authSecretRef.name".to_string(),
            });
        }
        if secret_ref.key.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "authSecretRef.key".to_string(),
            });
        }
    }

    Ok(())
}

/// Confirm the backend credential named by `authSecretRef` is readable and
/// non-empty. Policies without one pass.
pub async fn check_credentials<L: SecretLookup + ?Sized>(
    lookup: &L,
    namespace: &str,
    spec: &RemediationPolicySpec,
) -> Result<(), ResolveError> {
    if let Some(secret_ref) = &spec.auth_secret_ref {
        resolve_secret_value(lookup, namespace, secret_ref).await?;
    }
    Ok(())
}

fn check_confidence(field: String, value: f64) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::ConfidenceOutOfRange { field, value })
    }
}

#[instrument(skip(policy, ctx), fields(policy = %policy.name_any(), namespace = ?policy.namespace()))]
pub async fn reconcile_policy(policy: Arc<RemediationPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = policy.namespace().ok_or(Error::MissingObjectKey)?;
    let policies: Api<RemediationPolicy> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&policies, POLICY_FINALIZER_NAME, policy, |event| async {
        match event {
            FinalizerEvent::Apply(policy) => apply_policy(policy, &ctx).await,
            FinalizerEvent::Cleanup(policy) => cleanup_policy(policy, &ctx).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    })
}

fn policy_id(policy: &RemediationPolicy) -> Result<(String, String)> {
    let namespace = policy.namespace().ok_or(Error::MissingObjectKey)?;
    Ok((namespace, policy.name_any()))
}

async fn apply_policy(policy: Arc<RemediationPolicy>, ctx: &Context) -> Result<Action> {
    let (namespace, name) = policy_id(&policy)?;
    let id = format!("{namespace}/{name}");
    let generation = policy.metadata.generation;
    let grace = ctx.config.persistence.settings().shutdown_timeout;

    let existing = ctx.registry.get(&id);
    let status = existing.as_ref().map_or_else(
        || {
            Arc::new(StatusAggregator::new(
                KubePolicyStatusApi::new(ctx.client.clone(), &namespace, &name),
                ctx.config.status.limits(),
                ctx.config.status.conflict_retries,
            ))
        },
        |runtime| Arc::clone(&runtime.status),
    );

    if let Err(e) = validate_policy(&policy.spec) {
        warn!(policy = %id, error = %e, "Policy failed validation, not registering");
        ctx.registry.remove(&id, grace).await;
        ctx.metrics.set_policies_registered(ctx.registry.len());
        status
            .record(
                StatusDelta::condition(CONDITION_READY, false, e.reason(), e.to_string())
                    .with_observed_generation(generation),
            )
            .await;
        return Ok(Action::await_change());
    }

    let secrets = KubeSecretLookup::new(ctx.client.clone());
    if let Err(e) = check_credentials(&secrets, &namespace, &policy.spec).await {
        warn!(policy = %id, error = %e, "Backend credential unavailable, not registering");
        ctx.registry.remove(&id, grace).await;
        ctx.metrics.set_policies_registered(ctx.registry.len());
        status
            .record(
                StatusDelta::condition(CONDITION_READY, false, e.reason(), e.to_string())
                    .with_observed_generation(generation),
            )
            .await;
        return Ok(Action::requeue(ERROR_REQUEUE));
    }

    let cooldown = policy.spec.rate_limiting.cooldown();
    let cooldowns = existing.as_ref().map_or_else(
        || Arc::new(CooldownStore::with_retention(cooldown)),
        |runtime| Arc::clone(&runtime.cooldowns),
    );
    cooldowns.set_retention(cooldown);

    let (notifications, health) =
        PolicyNotifications::build(&secrets, &namespace, &policy.spec.notifications, &ctx.http).await;

    let persistence_enabled = policy.spec.persistence.enabled;
    let persister = if persistence_enabled && !ctx.registry.has_persistence(&id) {
        let persister = Persister::new(
            Arc::clone(&cooldowns),
            ConfigMapSnapshotBackend::for_policy(ctx.client.clone(), &policy),
            ctx.config.persistence.settings(),
        );
        let restored = persister.load(Utc::now()).await;
        debug!(policy = %id, restored, "Cooldown state loaded");
        Some(persister)
    } else {
        None
    };

    let runtime = Arc::new(PolicyRuntime {
        namespace: namespace.clone(),
        name: name.clone(),
        generation,
        spec: policy.spec.clone(),
        cooldowns,
        status: Arc::clone(&status),
        notifications,
    });
    ctx.registry.upsert(runtime);
    ctx.metrics.set_policies_registered(ctx.registry.len());

    if let Some(persister) = persister {
        let cancel = ctx.registry.child_token();
        let handle = tokio::spawn(persister.run(cancel.clone(), Some(Arc::clone(&status))));
        ctx.registry.attach_persistence(&id, PersistenceTask { cancel, handle });
    } else if !persistence_enabled {
        ctx.registry.detach_persistence(&id, grace).await;
    }

    let mut delta = StatusDelta::condition(
        CONDITION_READY,
        true,
        "Registered",
        format!("{} event selector(s) active", policy.spec.event_selectors.len()),
    )
    .with_observed_generation(generation);
    delta.merge(StatusDelta::condition(
        CONDITION_NOTIFICATIONS,
        health.healthy,
        health.reason,
        health.message,
    ));
    if !persistence_enabled {
        delta.merge(StatusDelta::condition(
            CONDITION_PERSISTENCE,
            true,
            "Disabled",
            "Cooldown state is kept in memory only",
        ));
    }
    status.record(delta).await;

    info!(
        policy = %id,
        generation = ?generation,
        selectors = policy.spec.event_selectors.len(),
        persistence = persistence_enabled,
        "Policy registered"
    );
    Ok(Action::requeue(POLICY_REQUEUE))
}

async fn cleanup_policy(policy: Arc<RemediationPolicy>, ctx: &Context) -> Result<Action> {
    let (namespace, name) = policy_id(&policy)?;
    let id = format!("{namespace}/{name}");
    let grace = ctx.config.persistence.settings().shutdown_timeout;

    if ctx.registry.remove(&id, grace).await {
        ctx.metrics.set_policies_registered(ctx.registry.len());
    }
    info!(policy = %id, "Policy cleaned up");
    Ok(Action::await_change())
}

/// Error policy for the `RemediationPolicy` controller
#[allow(clippy::needless_pass_by_value)]
pub fn error_policy(policy: Arc<RemediationPolicy>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        policy = %policy.name_any(),
        namespace = ?policy.namespace(),
        error = %error,
        "Policy reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}
