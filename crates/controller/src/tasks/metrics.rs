//! Process-wide counters served on `/metrics`.

use crate::remediation::Disposition;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    events_received: AtomicU64,
    events_stale: AtomicU64,
    events_duplicate: AtomicU64,
    events_rate_limited: AtomicU64,
    remediations_succeeded: AtomicU64,
    remediations_failed: AtomicU64,
    watch_errors: AtomicU64,
    policies_registered: AtomicU64,
    watch_ready: AtomicBool,
}

/// Point-in-time copy of [`ControllerMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_stale: u64,
    pub events_duplicate: u64,
    pub events_rate_limited: u64,
    pub remediations_succeeded: u64,
    pub remediations_failed: u64,
    pub watch_errors: u64,
    pub policies_registered: u64,
}

impl ControllerMetrics {
    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn watch_error(&self) {
        self.watch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_policies_registered(&self, count: usize) {
        self.policies_registered
            .store(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Count one policy's verdict on one event.
    pub fn record(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::NoMatch => return,
            Disposition::Stale => &self.events_stale,
            Disposition::Duplicate => &self.events_duplicate,
            Disposition::RateLimited { .. } => &self.events_rate_limited,
            Disposition::Remediated { success: true, .. } => &self.remediations_succeeded,
            Disposition::Remediated { success: false, .. } => &self.remediations_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// The event watch has completed its initial list.
    pub fn mark_watch_ready(&self) {
        self.watch_ready.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_watch_ready(&self) -> bool {
        self.watch_ready.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_stale: self.events_stale.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            events_rate_limited: self.events_rate_limited.load(Ordering::Relaxed),
            remediations_succeeded: self.remediations_succeeded.load(Ordering::Relaxed),
            remediations_failed: self.remediations_failed.load(Ordering::Relaxed),
            watch_errors: self.watch_errors.load(Ordering::Relaxed),
            policies_registered: self.policies_registered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediation::RateLimitKey;

    #[test]
    fn dispositions_land_in_their_counters() {
        let metrics = ControllerMetrics::default();
        let key = RateLimitKey::from("ops/p/batch/cronjob:nightly/BackOff");

        metrics.event_received();
        metrics.record(&Disposition::NoMatch);
        metrics.record(&Disposition::Duplicate);
        metrics.record(&Disposition::RateLimited { key: key.clone() });
        metrics.record(&Disposition::Remediated { key: key.clone(), success: true });
        metrics.record(&Disposition::Remediated { key, success: false });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_received, 1);
        assert_eq!(snapshot.events_duplicate, 1);
        assert_eq!(snapshot.events_rate_limited, 1);
        assert_eq!(snapshot.remediations_succeeded, 1);
        assert_eq!(snapshot.remediations_failed, 1);
        assert_eq!(snapshot.events_stale, 0);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let metrics = ControllerMetrics::default();
        metrics.set_policies_registered(3);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["policiesRegistered"], 3);
        assert!(!metrics.is_watch_ready());
    }
}
