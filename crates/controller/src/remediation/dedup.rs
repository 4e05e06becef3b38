//! Best-effort duplicate suppression
//!
//! Watch restarts and resyncs replay events that were already handled. Tokens
//! seen within the TTL are dropped. State lives only for the process lifetime.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// TTL cache of event uniqueness tokens
#[derive(Debug)]
pub struct EventDeduplicator {
    seen: DashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl EventDeduplicator {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Record `token`; returns `false` when it was already seen within the TTL.
    pub fn first_sighting(&self, token: &str) -> bool {
        self.first_sighting_at(token, Instant::now())
    }

    pub fn first_sighting_at(&self, token: &str, now: Instant) -> bool {
        if self.seen.len() >= self.max_entries {
            self.evict(now);
        }

        let mut first = true;
        self.seen
            .entry(token.to_string())
            .and_modify(|seen_at| {
                if now.saturating_duration_since(*seen_at) < self.ttl {
                    first = false;
                } else {
                    *seen_at = now;
                }
            })
            .or_insert(now);
        first
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drop expired tokens, then the oldest half if still at capacity.
    fn evict(&self, now: Instant) {
        let ttl = self.ttl;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < ttl);

        if self.seen.len() >= self.max_entries {
            let mut ages: Vec<Instant> = self.seen.iter().map(|e| *e.value()).collect();
            ages.sort_unstable();
            let cutoff = ages[ages.len() / 2];
            self.seen.retain(|_, seen_at| *seen_at > cutoff);
        }
        debug!(remaining = self.seen.len(), "Evicted dedup tokens");
    }
}
