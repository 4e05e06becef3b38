//! In-memory cooldown and events-per-minute limiting
//!
//! Each rate-limit key owns one map entry. Check-and-set happens while the
//! entry's shard lock is held, so two events for the same key are decided one
//! after the other while different keys never wait on each other.

use super::key::RateLimitKey;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::debug;

/// Snapshot format version written to storage.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Retention used until the owning policy sets its cooldown
const DEFAULT_RETENTION_SECS: i64 = 5 * 60;

#[derive(Debug, Default)]
struct KeyState {
    last_fired: Option<DateTime<Utc>>,
    /// Admission times inside the current one-minute window
    window: VecDeque<DateTime<Utc>>,
}

impl KeyState {
    fn trim_window(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::minutes(1);
        while self.window.front().is_some_and(|t| *t <= horizon) {
            self.window.pop_front();
        }
    }
}

/// Outcome of offering an event to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    /// Fire recorded; the caller should dispatch
    Allowed,
    /// Key fired less than one cooldown ago
    CoolingDown { remaining: Duration },
    /// Key exceeded its events-per-minute budget
    RateLimited,
}

impl FireDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Serializable view of all last-fired times.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownSnapshot {
    pub version: u32,
    pub entries: BTreeMap<RateLimitKey, DateTime<Utc>>,
}

impl CooldownSnapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries that fired at or before `now - max_age`; returns how many
    pub fn prune(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let before = self.entries.len();
        let horizon = now - max_age;
        self.entries.retain(|_, fired| *fired > horizon);
        before - self.entries.len()
    }
}

/// Per-policy cooldown state.
///
/// The store also carries the owning policy's current cooldown as its
/// retention, so eviction and snapshot pruning follow policy edits.
#[derive(Debug)]
pub struct CooldownStore {
    entries: DashMap<RateLimitKey, KeyState>,
    dirty: AtomicBool,
    retention_secs: AtomicI64,
}

impl Default for CooldownStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            dirty: AtomicBool::new(false),
            retention_secs: AtomicI64::new(DEFAULT_RETENTION_SECS),
        }
    }
}

impl CooldownStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        let store = Self::default();
        store.set_retention(retention);
        store
    }

    /// How long a fired key must be kept; the policy's current cooldown.
    pub fn set_retention(&self, retention: Duration) {
        let secs = retention.num_seconds().max(0);
        let previous = self.retention_secs.swap(secs, Ordering::AcqRel);
        if previous != secs {
            debug!(previous_secs = previous, retention_secs = secs, "Cooldown retention changed");
        }
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::seconds(self.retention_secs.load(Ordering::Acquire))
    }

    /// Allowed iff the key never fired or fired at least `cooldown` ago.
    /// Records the fire when allowed.
    pub fn try_fire(&self, key: &RateLimitKey, cooldown: Duration) -> bool {
        self.try_fire_at(key, cooldown, Utc::now())
    }

    /// `try_fire` with an explicit clock.
    pub fn try_fire_at(&self, key: &RateLimitKey, cooldown: Duration, now: DateTime<Utc>) -> bool {
        let mut state = self.entries.entry(key.clone()).or_default();
        let allowed = Self::fire_locked(&mut state, cooldown, now).is_allowed();
        drop(state);

        if allowed {
            self.mark_dirty();
        }
        allowed
    }

    /// Apply the events-per-minute budget, then the cooldown.
    ///
    /// An event refused by the per-minute budget does not touch the cooldown.
    pub fn admit(&self, key: &RateLimitKey, cooldown: Duration, events_per_minute: u32) -> FireDecision {
        self.admit_at(key, cooldown, events_per_minute, Utc::now())
    }

    pub fn admit_at(
        &self,
        key: &RateLimitKey,
        cooldown: Duration,
        events_per_minute: u32,
        now: DateTime<Utc>,
    ) -> FireDecision {
        let mut state = self.entries.entry(key.clone()).or_default();

        state.trim_window(now);
        if events_per_minute > 0 && state.window.len() >= events_per_minute as usize {
            debug!(key = %key, limit = events_per_minute, "Per-minute budget exhausted");
            return FireDecision::RateLimited;
        }
        state.window.push_back(now);

        let decision = Self::fire_locked(&mut state, cooldown, now);
        drop(state);

        if decision.is_allowed() {
            self.mark_dirty();
        }
        decision
    }

    fn fire_locked(state: &mut KeyState, cooldown: Duration, now: DateTime<Utc>) -> FireDecision {
        if let Some(last) = state.last_fired {
            let elapsed = now - last;
            if elapsed < cooldown {
                return FireDecision::CoolingDown {
                    remaining: cooldown - elapsed,
                };
            }
        }
        state.last_fired = Some(now);
        FireDecision::Allowed
    }

    /// Last fire time recorded for `key`
    #[must_use]
    pub fn last_fired(&self, key: &RateLimitKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).and_then(|state| state.last_fired)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> CooldownSnapshot {
        let entries = self
            .entries
            .iter()
            .filter_map(|entry| entry.value().last_fired.map(|t| (entry.key().clone(), t)))
            .collect();

        CooldownSnapshot {
            version: SNAPSHOT_VERSION,
            entries,
        }
    }

    /// Merge a snapshot in; the later fire time wins for keys present in both.
    pub fn restore(&self, snapshot: CooldownSnapshot) {
        for (key, fired) in snapshot.entries {
            let mut state = self.entries.entry(key).or_default();
            if state.last_fired.map_or(true, |current| current < fired) {
                state.last_fired = Some(fired);
            }
        }
    }

    /// Forget keys whose cooldown has passed and whose minute window is empty.
    pub fn evict_expired(&self, now: DateTime<Utc>, cooldown: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, state| {
            state.trim_window(now);
            let cooling = state.last_fired.is_some_and(|t| now - t < cooldown);
            cooling || !state.window.is_empty()
        });
        before.saturating_sub(self.entries.len())
    }

    /// `evict_expired` against the current retention.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        self.evict_expired(now, self.retention())
    }

    /// Flag unsaved changes.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}
