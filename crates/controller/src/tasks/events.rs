//! Cluster event watch
//!
//! Streams `v1/Event` objects and runs each through every registered policy.
//! Events are handled with bounded concurrency; policies for one event run
//! concurrently too.

use super::metrics::ControllerMetrics;
use super::types::{Context, Result};
use crate::remediation::{ClusterEvent, Disposition, OwnerLookup, Pipeline, PolicyRuntime, SecretLookup};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Watch events until the stream ends.
#[instrument(skip(ctx), fields(namespace = ?ctx.namespace))]
pub async fn run_event_watcher(ctx: Arc<Context>) -> Result<()> {
    let events: Api<Event> = match &ctx.namespace {
        Some(namespace) => Api::namespaced(ctx.client.clone(), namespace),
        None => Api::all(ctx.client.clone()),
    };
    let concurrency = ctx.config.watch.concurrency;
    info!(concurrency, "Starting event watcher");

    watcher(events, watcher::Config::default())
        .default_backoff()
        .for_each_concurrent(concurrency, |result| {
            let ctx = Arc::clone(&ctx);
            async move {
                match result {
                    Ok(watcher::Event::Apply(event) | watcher::Event::InitApply(event)) => {
                        if ctx.registry.is_shutting_down() {
                            return;
                        }
                        let event = ClusterEvent::from(&event);
                        let runtimes = ctx.registry.runtimes();
                        process_event(&ctx.pipeline, &runtimes, &event, &ctx.metrics).await;
                    }
                    Ok(watcher::Event::InitDone) => {
                        ctx.metrics.mark_watch_ready();
                        info!("Initial event list processed");
                    }
                    Ok(watcher::Event::Init | watcher::Event::Delete(_)) => {}
                    Err(e) => {
                        ctx.metrics.watch_error();
                        warn!(error = %e, "Event watch error");
                    }
                }
            }
        })
        .await;

    info!("Event watcher stopped");
    Ok(())
}

/// Run one event through every policy and count the verdicts.
pub async fn process_event<O: OwnerLookup, S: SecretLookup>(
    pipeline: &Pipeline<O, S>,
    runtimes: &[Arc<PolicyRuntime>],
    event: &ClusterEvent,
    metrics: &ControllerMetrics,
) -> Vec<Disposition> {
    metrics.event_received();

    let verdicts = futures::future::join_all(
        runtimes
            .iter()
            .map(|runtime| pipeline.process(runtime, event)),
    )
    .await;

    for disposition in &verdicts {
        metrics.record(disposition);
    }
    if verdicts.iter().all(|d| *d == Disposition::NoMatch) {
        debug!(event = %event.describe(), "No policy matched");
    }
    verdicts
}
