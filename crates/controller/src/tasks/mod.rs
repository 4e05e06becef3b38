use crate::crds::RemediationPolicy;
use crate::remediation::{
    EventDeduplicator, KubeOwnerLookup, KubeSecretLookup, Pipeline, RemediationDispatcher,
};
use futures::StreamExt;
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, Instrument};

pub mod config;
pub mod events;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use metrics::{ControllerMetrics, MetricsSnapshot};
pub use policy::{error_policy, reconcile_policy, validate_policy};
pub use registry::PolicyRegistry;
pub use types::{Context, Error, Result};

/// Wire the shared context from a validated configuration.
pub fn build_context(
    client: Client,
    config: ControllerConfig,
    namespace: Option<String>,
) -> Result<Arc<Context>> {
    if let Err(validation_error) = config.validate() {
        error!("Configuration validation failed: {}", validation_error);
        return Err(Error::ConfigError(validation_error.to_string()));
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("remediation-controller/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {e}")))?;

    let dispatcher = RemediationDispatcher::new(
        http.clone(),
        config.dispatch.retry.policy(),
        config.dispatch.request_timeout(),
    );
    let pipeline = Pipeline::new(
        KubeOwnerLookup::new(client.clone()),
        KubeSecretLookup::new(client.clone()),
        dispatcher,
        EventDeduplicator::new(config.dedup.ttl(), config.dedup.max_entries),
        config.watch.max_event_age(),
    );

    debug!("Controller context created");
    Ok(Arc::new(Context {
        client,
        namespace: namespace.or_else(|| config.watch.namespace.clone()),
        config: Arc::new(config),
        registry: Arc::new(PolicyRegistry::new()),
        pipeline: Arc::new(pipeline),
        http,
        metrics: Arc::new(ControllerMetrics::default()),
    }))
}

/// Run the policy controller, the event watcher and the cooldown sweeper.
#[instrument(skip(ctx), fields(namespace = ?ctx.namespace))]
pub async fn run_controllers(ctx: Arc<Context>) -> Result<()> {
    info!("Starting RemediationPolicy controller and event watcher...");

    let policy_handle = tokio::spawn({
        let ctx = Arc::clone(&ctx);
        async move { run_policy_controller(ctx).await }
    });
    let watcher_handle = tokio::spawn({
        let ctx = Arc::clone(&ctx);
        async move { events::run_event_watcher(ctx).await }
    });
    let sweeper_handle = tokio::spawn({
        let registry = Arc::clone(&ctx.registry);
        let interval = ctx.config.persistence.settings().sync_interval;
        async move { registry.run_sweeper(interval).await }
    });

    match tokio::try_join!(policy_handle, watcher_handle, sweeper_handle) {
        Ok((policy_result, watcher_result, ())) => {
            if let Err(e) = policy_result {
                error!("RemediationPolicy controller failed: {:?}", e);
            }
            if let Err(e) = watcher_result {
                error!("Event watcher failed: {:?}", e);
            }
        }
        Err(e) => {
            error!("Controller task join error: {:?}", e);
        }
    }

    info!("Controllers shutting down");
    Ok(())
}

/// Run the `RemediationPolicy` controller
async fn run_policy_controller(ctx: Arc<Context>) -> Result<()> {
    info!("Starting RemediationPolicy controller");

    let policies: Api<RemediationPolicy> = match &ctx.namespace {
        Some(namespace) => Api::namespaced(ctx.client.clone(), namespace),
        None => Api::all(ctx.client.clone()),
    };

    Controller::new(policies, Config::default().any_semantic())
        .run(reconcile_policy, error_policy, ctx)
        .for_each(|reconciliation_result| {
            let policy_span = tracing::info_span!("policy_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(policy) => {
                        debug!(resource = ?policy, "RemediationPolicy reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = ?reconciliation_err, "RemediationPolicy reconciliation error");
                    }
                }
            }
            .instrument(policy_span)
        })
        .await;

    info!("RemediationPolicy controller stopped");
    Ok(())
}
