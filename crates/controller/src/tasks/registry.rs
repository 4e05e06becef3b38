//! Registered policies and their background persistence tasks
//!
//! The policy controller writes here; event handlers only read. Each policy's
//! persistence task gets a child of the registry's root token, so cancelling
//! the root on shutdown stops every task, and each task makes a final bounded
//! write before exiting. A single sweeper evicts expired cooldown keys for
//! every policy, persisted or not.

use crate::remediation::PolicyRuntime;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A running cooldown persistence task
#[derive(Debug)]
pub struct PersistenceTask {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl PersistenceTask {
    /// Cancel and wait up to `grace` for the final write.
    async fn stop(self, id: &str, grace: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.handle).await.is_err() {
            warn!(policy = %id, grace_secs = grace.as_secs(), "Persistence task did not stop in time");
        }
    }
}

struct Registered {
    runtime: Arc<PolicyRuntime>,
    persistence: Option<PersistenceTask>,
}

#[derive(Default)]
pub struct PolicyRegistry {
    policies: DashMap<String, Registered>,
    root: CancellationToken,
}

impl PolicyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a new persistence task
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<PolicyRuntime>> {
        self.policies.get(id).map(|entry| Arc::clone(&entry.runtime))
    }

    /// Every registered runtime, in no particular order
    #[must_use]
    pub fn runtimes(&self) -> Vec<Arc<PolicyRuntime>> {
        self.policies
            .iter()
            .map(|entry| Arc::clone(&entry.runtime))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    #[must_use]
    pub fn has_persistence(&self, id: &str) -> bool {
        self.policies
            .get(id)
            .is_some_and(|entry| entry.persistence.is_some())
    }

    /// Insert or replace a runtime. A running persistence task is kept.
    pub fn upsert(&self, runtime: Arc<PolicyRuntime>) {
        let id = runtime.id();
        self.policies
            .entry(id.clone())
            .and_modify(|entry| entry.runtime = Arc::clone(&runtime))
            .or_insert_with(|| Registered {
                runtime,
                persistence: None,
            });
        debug!(policy = %id, "Policy runtime registered");
    }

    /// Attach a persistence task to a registered policy. A task for an
    /// unknown policy is cancelled right away.
    pub fn attach_persistence(&self, id: &str, task: PersistenceTask) {
        match self.policies.get_mut(id) {
            Some(mut entry) => {
                if let Some(previous) = entry.persistence.replace(task) {
                    previous.cancel.cancel();
                }
            }
            None => task.cancel.cancel(),
        }
    }

    /// Stop a policy's persistence task, keeping the runtime registered.
    pub async fn detach_persistence(&self, id: &str, grace: Duration) {
        let task = self
            .policies
            .get_mut(id)
            .and_then(|mut entry| entry.persistence.take());
        if let Some(task) = task {
            task.stop(id, grace).await;
        }
    }

    /// Unregister a policy and stop its persistence task. Returns whether it
    /// was registered.
    pub async fn remove(&self, id: &str, grace: Duration) -> bool {
        let Some((_, registered)) = self.policies.remove(id) else {
            return false;
        };
        if let Some(task) = registered.persistence {
            task.stop(id, grace).await;
        }
        info!(policy = %id, "Policy unregistered");
        true
    }

    /// Evict expired cooldown keys from every registered policy. Returns the
    /// number of keys dropped.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        self.runtimes()
            .iter()
            .map(|runtime| runtime.cooldowns.evict_idle(now))
            .sum()
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run_sweeper(&self, interval: Duration) {
        let cancel = self.child_token();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep_expired(Utc::now());
                    if evicted > 0 {
                        debug!(evicted, policies = self.len(), "Evicted expired cooldown keys");
                    }
                }
            }
        }
        debug!("Cooldown sweeper stopped");
    }

    /// Cancel every persistence task and wait for their final writes.
    pub async fn shutdown(&self, grace: Duration) {
        self.root.cancel();

        let tasks: Vec<(String, PersistenceTask)> = self
            .policies
            .iter_mut()
            .filter_map(|mut entry| {
                let id = entry.key().clone();
                entry.persistence.take().map(|task| (id, task))
            })
            .collect();

        info!(tasks = tasks.len(), "Stopping persistence tasks");
        let stops = tasks.into_iter().map(|(id, task)| async move {
            task.stop(&id, grace).await;
        });
        futures::future::join_all(stops).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::RemediationPolicySpec;
    use crate::remediation::{
        CooldownStore, InMemoryPolicyStatus, PolicyNotifications, RateLimitKey, StatusAggregator,
        StatusLimits,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn runtime(name: &str) -> Arc<PolicyRuntime> {
        runtime_with_store(name, Arc::new(CooldownStore::new()))
    }

    fn runtime_with_store(name: &str, cooldowns: Arc<CooldownStore>) -> Arc<PolicyRuntime> {
        let spec: RemediationPolicySpec = serde_json::from_value(serde_json::json!({
            "eventSelectors": [{}],
            "remediationEndpoint": "http://backend:8080/remediate"
        }))
        .unwrap();
        Arc::new(PolicyRuntime {
            namespace: "ops".to_string(),
            name: name.to_string(),
            generation: Some(1),
            spec,
            cooldowns,
            status: Arc::new(StatusAggregator::new(
                Arc::new(InMemoryPolicyStatus::default()),
                StatusLimits::default(),
                5,
            )),
            notifications: PolicyNotifications::default(),
        })
    }

    fn task(registry: &PolicyRegistry, finished: Arc<AtomicBool>) -> PersistenceTask {
        let cancel = registry.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            finished.store(true, Ordering::SeqCst);
        });
        PersistenceTask { cancel, handle }
    }

    #[tokio::test]
    async fn upsert_replaces_runtime_and_keeps_persistence() {
        let registry = PolicyRegistry::new();
        registry.upsert(runtime("a"));
        let finished = Arc::new(AtomicBool::new(false));
        registry.attach_persistence("ops/a", task(&registry, Arc::clone(&finished)));

        let replacement = runtime("a");
        registry.upsert(Arc::clone(&replacement));

        assert_eq!(registry.len(), 1);
        assert!(registry.has_persistence("ops/a"));
        assert!(Arc::ptr_eq(&registry.get("ops/a").unwrap(), &replacement));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn remove_stops_persistence() {
        let registry = PolicyRegistry::new();
        registry.upsert(runtime("a"));
        let finished = Arc::new(AtomicBool::new(false));
        registry.attach_persistence("ops/a", task(&registry, Arc::clone(&finished)));

        assert!(registry.remove("ops/a", Duration::from_secs(1)).await);
        assert!(finished.load(Ordering::SeqCst));
        assert!(registry.get("ops/a").is_none());
        assert!(!registry.remove("ops/a", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn shutdown_stops_every_task() {
        let registry = PolicyRegistry::new();
        let flags: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
        for (i, flag) in flags.iter().enumerate() {
            let name = format!("p{i}");
            registry.upsert(runtime(&name));
            registry.attach_persistence(&format!("ops/{name}"), task(&registry, Arc::clone(flag)));
        }

        registry.shutdown(Duration::from_secs(1)).await;

        assert!(registry.is_shutting_down());
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
        // runtimes stay readable for in-flight events
        assert_eq!(registry.runtimes().len(), 3);
    }

    #[tokio::test]
    async fn persistence_for_unknown_policy_is_cancelled() {
        let registry = PolicyRegistry::new();
        let t = task(&registry, Arc::new(AtomicBool::new(false)));
        let cancel = t.cancel.clone();
        registry.attach_persistence("ops/missing", t);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn sweep_shrinks_stores_without_persistence() {
        let registry = PolicyRegistry::new();
        let store = Arc::new(CooldownStore::with_retention(chrono::Duration::minutes(5)));
        let now = Utc::now();
        for i in 0..50 {
            let key = RateLimitKey::from(format!("ops/a/apps/deployment:web-{i}/BackOff"));
            store.try_fire_at(&key, chrono::Duration::minutes(5), now - chrono::Duration::minutes(30));
        }
        let fresh = RateLimitKey::from("ops/a/apps/deployment:api/BackOff");
        store.try_fire_at(&fresh, chrono::Duration::minutes(5), now);
        registry.upsert(runtime_with_store("a", Arc::clone(&store)));

        assert!(!registry.has_persistence("ops/a"));
        assert_eq!(registry.sweep_expired(now), 50);
        assert_eq!(store.len(), 1);
        assert!(store.last_fired(&fresh).is_some());
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let registry = Arc::new(PolicyRegistry::new());
        let sweeper = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.run_sweeper(Duration::from_millis(10)).await }
        });

        registry.shutdown(Duration::from_secs(1)).await;
        assert!(tokio::time::timeout(Duration::from_secs(1), sweeper).await.is_ok());
    }
}
