//! Durable cooldown snapshots
//!
//! One snapshot per policy lives in the ConfigMap `<policy>-cooldown-state`
//! under `cooldowns.json`. Writes are size bounded: expired entries are pruned,
//! then the oldest are dropped until the payload fits. A storage rejection for
//! size pauses persistence for a fixed window while in-memory limiting keeps
//! working.

use super::cooldown::{CooldownSnapshot, CooldownStore};
use super::error::PersistenceError;
use super::key::RateLimitKey;
use super::status::StatusAggregator;
use crate::crds::RemediationPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Data key holding the snapshot JSON
pub const SNAPSHOT_KEY: &str = "cooldowns.json";

/// Label identifying objects written by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "remediation-controller";
pub const POLICY_LABEL: &str = "remediation.platform/policy";

#[must_use]
pub fn configmap_name(policy_name: &str) -> String {
    format!("{policy_name}-cooldown-state")
}

/// Storage for one policy's snapshot.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Raw snapshot, `None` when nothing was stored yet
    async fn load(&self) -> Result<Option<String>, PersistenceError>;

    async fn store(&self, payload: String) -> Result<(), PersistenceError>;
}

/// Snapshot stored in a ConfigMap owned by the policy.
pub struct ConfigMapSnapshotBackend {
    configmaps: Api<ConfigMap>,
    name: String,
    namespace: String,
    policy_name: String,
    owner: Option<OwnerReference>,
}

impl ConfigMapSnapshotBackend {
    #[must_use]
    pub fn for_policy(client: Client, policy: &RemediationPolicy) -> Self {
        let namespace = policy.namespace().unwrap_or_else(|| "default".to_string());
        let policy_name = policy.name_any();
        Self {
            configmaps: Api::namespaced(client, &namespace),
            name: configmap_name(&policy_name),
            namespace,
            policy_name,
            owner: policy.controller_owner_ref(&()),
        }
    }

    fn build(&self, payload: String) -> ConfigMap {
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (POLICY_LABEL.to_string(), self.policy_name.clone()),
        ]);

        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                owner_references: self.owner.clone().map(|owner| vec![owner]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(SNAPSHOT_KEY.to_string(), payload)])),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SnapshotBackend for ConfigMapSnapshotBackend {
    async fn load(&self) -> Result<Option<String>, PersistenceError> {
        let Some(cm) = self.configmaps.get_opt(&self.name).await? else {
            debug!(configmap = %self.name, "No stored cooldown snapshot");
            return Ok(None);
        };

        let payload = cm.data.and_then(|mut data| data.remove(SNAPSHOT_KEY));
        if payload.is_none() {
            warn!(configmap = %self.name, key = SNAPSHOT_KEY, "ConfigMap has no snapshot key");
        }
        Ok(payload)
    }

    async fn store(&self, payload: String) -> Result<(), PersistenceError> {
        let cm = self.build(payload);

        // Create first, then patch if it exists
        match self.configmaps.create(&PostParams::default(), &cm).await {
            Ok(_) => {
                debug!(configmap = %self.name, "Created cooldown snapshot ConfigMap");
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                let patch = serde_json::json!({ "data": cm.data });
                self.configmaps
                    .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!(configmap = %self.name, "Updated cooldown snapshot ConfigMap");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Process-local backend for tests and dry runs.
#[derive(Default)]
pub struct InMemorySnapshotBackend {
    payload: Mutex<Option<String>>,
    writes: Mutex<usize>,
    reject_too_large: Mutex<bool>,
}

impl InMemorySnapshotBackend {
    #[must_use]
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: Mutex::new(Some(payload.into())),
            ..Default::default()
        }
    }

    /// Make every store fail as if the object exceeded the size ceiling.
    pub fn set_reject_too_large(&self, reject: bool) {
        if let Ok(mut flag) = self.reject_too_large.lock() {
            *flag = reject;
        }
    }

    #[must_use]
    pub fn stored(&self) -> Option<String> {
        self.payload.lock().ok().and_then(|p| p.clone())
    }

    /// Successful writes so far
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotBackend for InMemorySnapshotBackend {
    async fn load(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self.stored())
    }

    async fn store(&self, payload: String) -> Result<(), PersistenceError> {
        if self.reject_too_large.lock().map(|f| *f).unwrap_or(false) {
            return Err(PersistenceError::TooLarge(format!(
                "{} bytes rejected",
                payload.len()
            )));
        }
        if let Ok(mut stored) = self.payload.lock() {
            *stored = Some(payload);
        }
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl<B: SnapshotBackend + ?Sized> SnapshotBackend for Arc<B> {
    async fn load(&self) -> Result<Option<String>, PersistenceError> {
        (**self).load().await
    }

    async fn store(&self, payload: String) -> Result<(), PersistenceError> {
        (**self).store(payload).await
    }
}

/// Serialize `snapshot`, dropping its oldest entries until the payload fits
/// in `max_bytes`.
pub fn encode_bounded(
    snapshot: &mut CooldownSnapshot,
    max_bytes: usize,
) -> Result<String, PersistenceError> {
    let mut payload = serde_json::to_string(snapshot)?;
    if payload.len() <= max_bytes {
        return Ok(payload);
    }

    let mut by_age: Vec<(DateTime<Utc>, RateLimitKey)> = snapshot
        .entries
        .iter()
        .map(|(key, fired)| (*fired, key.clone()))
        .collect();
    by_age.sort();
    let mut oldest_first = by_age.into_iter();

    while payload.len() > max_bytes {
        if snapshot.entries.is_empty() {
            return Err(PersistenceError::TooLarge(format!(
                "empty snapshot is {} bytes, limit {max_bytes}",
                payload.len()
            )));
        }

        let excess = payload.len() - max_bytes;
        let per_entry = (payload.len() / snapshot.entries.len()).max(1);
        let batch = (excess / per_entry).max(1);
        for (_, key) in oldest_first.by_ref().take(batch) {
            snapshot.entries.remove(&key);
        }
        payload = serde_json::to_string(snapshot)?;
    }

    Ok(payload)
}

/// Timing and size limits for one persister.
#[derive(Debug, Clone)]
pub struct PersistSettings {
    pub sync_interval: std::time::Duration,
    pub min_persist_interval: Duration,
    pub max_snapshot_bytes: usize,
    pub too_large_backoff: Duration,
    pub shutdown_timeout: std::time::Duration,
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self {
            sync_interval: std::time::Duration::from_secs(30),
            min_persist_interval: Duration::seconds(60),
            max_snapshot_bytes: 512 * 1024,
            too_large_backoff: Duration::minutes(5),
            shutdown_timeout: std::time::Duration::from_secs(5),
        }
    }
}

/// Result of one write attempt, forwarded to the policy status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistReport {
    Persisted {
        at: DateTime<Utc>,
        entries: usize,
    },
    Failed {
        at: DateTime<Utc>,
        error: String,
        backoff_until: Option<DateTime<Utc>>,
    },
}

/// Periodically writes one policy's cooldown store.
pub struct Persister<B> {
    store: Arc<CooldownStore>,
    backend: B,
    settings: PersistSettings,
    last_success: Option<DateTime<Utc>>,
    backoff_until: Option<DateTime<Utc>>,
}

impl<B: SnapshotBackend> Persister<B> {
    /// Snapshots keep entries younger than the store's retention, read on
    /// every load and write.
    pub fn new(store: Arc<CooldownStore>, backend: B, settings: PersistSettings) -> Self {
        Self {
            store,
            backend,
            settings,
            last_success: None,
            backoff_until: None,
        }
    }

    #[must_use]
    pub fn backoff_until(&self) -> Option<DateTime<Utc>> {
        self.backoff_until
    }

    /// Restore the stored snapshot into the store. Absent or unreadable
    /// snapshots leave the store empty. Returns the restored entry count.
    pub async fn load(&self, now: DateTime<Utc>) -> usize {
        let raw = match self.backend.load().await {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                warn!(error = %e, "Could not read cooldown snapshot, starting empty");
                return 0;
            }
        };

        let mut snapshot: CooldownSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let e = PersistenceError::Corrupt(e.to_string());
                warn!(error = %e, "Discarding cooldown snapshot, starting empty");
                return 0;
            }
        };

        let pruned = snapshot.prune(now, self.store.retention());
        let restored = snapshot.len();
        self.store.restore(snapshot);
        info!(restored, pruned, "Restored cooldown snapshot");
        restored
    }

    /// Write when the store is dirty, outside any backoff, and the minimum
    /// interval since the last successful write has passed.
    pub async fn persist_if_due(&mut self, now: DateTime<Utc>) -> Option<PersistReport> {
        if self.backoff_until.is_some_and(|until| now < until) {
            debug!(until = ?self.backoff_until, "Persistence paused after size rejection");
            return None;
        }
        if !self.store.is_dirty() {
            return None;
        }
        if self
            .last_success
            .is_some_and(|last| now - last < self.settings.min_persist_interval)
        {
            return None;
        }
        Some(self.persist_now(now).await)
    }

    /// Write unconditionally.
    pub async fn persist_now(&mut self, now: DateTime<Utc>) -> PersistReport {
        self.store.take_dirty();

        let mut snapshot = self.store.snapshot();
        snapshot.prune(now, self.store.retention());
        let result = match encode_bounded(&mut snapshot, self.settings.max_snapshot_bytes) {
            Ok(payload) => self.backend.store(payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.last_success = Some(now);
                self.backoff_until = None;
                debug!(entries = snapshot.len(), "Persisted cooldown snapshot");
                PersistReport::Persisted {
                    at: now,
                    entries: snapshot.len(),
                }
            }
            Err(e) => {
                // Retry on a later tick
                self.store.mark_dirty();
                if e.is_too_large() {
                    self.backoff_until = Some(now + self.settings.too_large_backoff);
                    warn!(
                        error = %e,
                        backoff_until = ?self.backoff_until,
                        "Cooldown snapshot rejected for size, pausing persistence"
                    );
                } else {
                    self.backoff_until = None;
                    error!(error = %e, "Failed to persist cooldown snapshot");
                }
                PersistReport::Failed {
                    at: now,
                    error: e.to_string(),
                    backoff_until: self.backoff_until,
                }
            }
        }
    }

    /// Run until `cancel` fires, then make one final bounded write.
    pub async fn run(mut self, cancel: CancellationToken, status: Option<Arc<StatusAggregator>>) {
        let mut ticker = tokio::time::interval(self.settings.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(report) = self.persist_if_due(Utc::now()).await {
                        if let Some(status) = &status {
                            status.record_persistence(&report).await;
                        }
                    }
                }
            }
        }

        let in_backoff = self.backoff_until.is_some_and(|until| Utc::now() < until);
        if !self.store.is_dirty() || in_backoff {
            return;
        }

        let timeout = self.settings.shutdown_timeout;
        match tokio::time::timeout(timeout, self.persist_now(Utc::now())).await {
            Ok(PersistReport::Persisted { entries, .. }) => {
                info!(entries, "Final cooldown snapshot written");
            }
            Ok(PersistReport::Failed { error, .. }) => {
                warn!(error = %error, "Final cooldown snapshot failed");
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Final cooldown snapshot timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap()
    }

    fn key(i: usize) -> RateLimitKey {
        RateLimitKey::from(format!("ops/policy/batch/pod:worker-{i:04}/BackOff"))
    }

    fn persister(
        store: Arc<CooldownStore>,
        backend: InMemorySnapshotBackend,
    ) -> Persister<InMemorySnapshotBackend> {
        store.set_retention(Duration::minutes(15));
        Persister::new(store, backend, PersistSettings::default())
    }

    #[tokio::test]
    async fn absent_snapshot_starts_empty() {
        let store = Arc::new(CooldownStore::new());
        let persister = persister(Arc::clone(&store), InMemorySnapshotBackend::default());
        assert_eq!(persister.load(at(0)).await, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let store = Arc::new(CooldownStore::new());
        let backend = InMemorySnapshotBackend::with_payload("{not json");
        let persister = persister(Arc::clone(&store), backend);
        assert_eq!(persister.load(at(0)).await, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn load_restores_and_prunes() {
        let raw = serde_json::json!({
            "version": 1,
            "entries": {
                "ops/p/batch/cronjob:nightly/BackOff": "2025-03-01T12:10:00Z",
                "ops/p/batch/pod:stale/BackOff": "2025-03-01T11:00:00Z"
            }
        })
        .to_string();
        let store = Arc::new(CooldownStore::new());
        let persister = persister(Arc::clone(&store), InMemorySnapshotBackend::with_payload(raw));

        assert_eq!(persister.load(at(12)).await, 1);
        let nightly = RateLimitKey::from("ops/p/batch/cronjob:nightly/BackOff");
        assert!(!store.try_fire_at(&nightly, Duration::minutes(15), at(14)));
    }

    #[tokio::test]
    async fn writes_only_when_dirty_and_interval_elapsed() {
        let store = Arc::new(CooldownStore::new());
        let mut persister = persister(Arc::clone(&store), InMemorySnapshotBackend::default());

        assert_eq!(persister.persist_if_due(at(0)).await, None);

        store.try_fire_at(&key(1), Duration::minutes(15), at(0));
        assert!(matches!(
            persister.persist_if_due(at(0)).await,
            Some(PersistReport::Persisted { entries: 1, .. })
        ));
        assert_eq!(persister.backend.writes(), 1);

        // dirty again, but inside the minimum interval
        store.try_fire_at(&key(2), Duration::minutes(15), at(0));
        assert_eq!(persister.persist_if_due(at(0)).await, None);
        assert!(persister.persist_if_due(at(1)).await.is_some());
        assert_eq!(persister.backend.writes(), 2);
    }

    #[tokio::test]
    async fn size_rejection_pauses_persistence_but_not_limiting() {
        let store = Arc::new(CooldownStore::new());
        let backend = InMemorySnapshotBackend::default();
        backend.set_reject_too_large(true);
        let mut persister = persister(Arc::clone(&store), backend);

        store.try_fire_at(&key(1), Duration::minutes(15), at(0));
        let report = persister.persist_if_due(at(0)).await;
        assert!(matches!(
            report,
            Some(PersistReport::Failed { backoff_until: Some(until), .. }) if until == at(5)
        ));

        // in-memory limiting still works during the backoff
        assert!(!store.try_fire_at(&key(1), Duration::minutes(15), at(1)));
        assert!(store.try_fire_at(&key(2), Duration::minutes(15), at(1)));

        persister.backend.set_reject_too_large(false);
        assert_eq!(persister.persist_if_due(at(3)).await, None);
        assert_eq!(persister.backend.writes(), 0);

        assert!(matches!(
            persister.persist_if_due(at(5)).await,
            Some(PersistReport::Persisted { entries: 2, .. })
        ));
        assert_eq!(persister.backoff_until(), None);
    }

    #[tokio::test]
    async fn raised_cooldown_keeps_keys_in_snapshots() {
        let store = Arc::new(CooldownStore::with_retention(Duration::minutes(5)));
        let backend = Arc::new(InMemorySnapshotBackend::default());
        let mut persister = Persister::new(Arc::clone(&store), Arc::clone(&backend), PersistSettings::default());

        store.try_fire_at(&key(1), Duration::minutes(5), at(0));
        store.set_retention(Duration::minutes(60));

        assert_eq!(store.evict_idle(at(10)), 0);
        assert!(matches!(
            persister.persist_now(at(10)).await,
            PersistReport::Persisted { entries: 1, .. }
        ));
        assert!(!store.try_fire_at(&key(1), Duration::minutes(60), at(10)));

        let restarted = Arc::new(CooldownStore::with_retention(Duration::minutes(60)));
        let reloaded = Persister::new(Arc::clone(&restarted), backend, PersistSettings::default());
        assert_eq!(reloaded.load(at(10)).await, 1);
        assert!(!restarted.try_fire_at(&key(1), Duration::minutes(60), at(10)));
    }

    #[test]
    fn oversized_snapshot_drops_oldest_entries() {
        let mut snapshot = CooldownSnapshot::default();
        for i in 0..200 {
            let fired = at(0) + Duration::seconds(i64::try_from(i).unwrap());
            snapshot.entries.insert(key(i), fired);
        }
        let limit = 4 * 1024;

        let payload = encode_bounded(&mut snapshot, limit).unwrap();
        assert!(payload.len() <= limit);
        assert!(!snapshot.is_empty());
        assert!(snapshot.len() < 200);
        // newest entry survives, oldest is gone
        assert!(snapshot.entries.contains_key(&key(199)));
        assert!(!snapshot.entries.contains_key(&key(0)));
    }

    #[test]
    fn small_snapshot_is_untouched() {
        let mut snapshot = CooldownSnapshot::default();
        snapshot.entries.insert(key(1), at(0));
        let payload = encode_bounded(&mut snapshot, 512 * 1024).unwrap();
        assert!(payload.contains("worker-0001"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn configmap_naming() {
        assert_eq!(configmap_name("batch-failures"), "batch-failures-cooldown-state");
    }
}
