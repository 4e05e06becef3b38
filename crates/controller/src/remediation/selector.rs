//! Ordered event-selector matching
//!
//! Selectors are evaluated in declaration order and the first one whose
//! non-empty fields all equal the event wins. An unset or empty field is a
//! wildcard. No reordering or overlap detection happens here: a catch-all
//! selector placed before a specific one shadows it, and that is the
//! caller's contract.

use super::event::ClusterEvent;
use crate::crds::{EventSelector, RemediationMode, RemediationPolicySpec, RiskLevel};

/// Settings in force for one matched event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveSettings {
    pub mode: RemediationMode,
    pub confidence_threshold: f64,
    pub max_risk_level: RiskLevel,
}

/// First selector that matched, with its effective settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorMatch<'a> {
    /// Position in the policy's selector list
    pub index: usize,
    pub selector: &'a EventSelector,
    pub settings: EffectiveSettings,
}

fn field_matches(expected: Option<&String>, actual: &str) -> bool {
    match expected.map(String::as_str) {
        None | Some("") => true,
        Some(expected) => expected == actual,
    }
}

/// Whether every non-empty field of `selector` equals the event's value.
#[must_use]
pub fn selector_matches(selector: &EventSelector, event: &ClusterEvent) -> bool {
    field_matches(selector.event_type.as_ref(), &event.event_type)
        && field_matches(selector.reason.as_ref(), &event.reason)
        && field_matches(
            selector.involved_object_kind.as_ref(),
            &event.involved_object.kind,
        )
        && field_matches(selector.namespace.as_ref(), &event.namespace)
}

/// Selector override if present, otherwise the policy default.
#[must_use]
pub fn effective_settings(selector: &EventSelector, spec: &RemediationPolicySpec) -> EffectiveSettings {
    EffectiveSettings {
        mode: selector.mode.unwrap_or(spec.mode),
        confidence_threshold: selector
            .confidence_threshold
            .unwrap_or(spec.confidence_threshold),
        max_risk_level: selector.max_risk_level.unwrap_or(spec.max_risk_level),
    }
}

/// Return the first matching selector of `spec`, if any.
#[must_use]
pub fn match_event<'a>(spec: &'a RemediationPolicySpec, event: &ClusterEvent) -> Option<SelectorMatch<'a>> {
    spec.event_selectors
        .iter()
        .enumerate()
        .find(|(_, selector)| selector_matches(selector, event))
        .map(|(index, selector)| SelectorMatch {
            index,
            selector,
            settings: effective_settings(selector, spec),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediation::event::InvolvedObject;

    fn spec(selectors: Vec<EventSelector>) -> RemediationPolicySpec {
        RemediationPolicySpec {
            event_selectors: selectors,
            remediation_endpoint: "http://backend".to_string(),
            auth_secret_ref: None,
            mode: RemediationMode::Manual,
            confidence_threshold: 0.8,
            max_risk_level: RiskLevel::Low,
            rate_limiting: Default::default(),
            notifications: Default::default(),
            persistence: Default::default(),
        }
    }

    fn event(event_type: &str, reason: &str, kind: &str, namespace: &str) -> ClusterEvent {
        ClusterEvent {
            namespace: namespace.to_string(),
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            involved_object: InvolvedObject {
                kind: kind.to_string(),
                name: "payment-db-0".to_string(),
                namespace: namespace.to_string(),
                uid: None,
            },
            ..Default::default()
        }
    }

    fn selector(event_type: &str, reason: &str, kind: &str) -> EventSelector {
        EventSelector {
            event_type: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            involved_object_kind: Some(kind.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn failed_scheduling_selector_matches_in_automatic_mode() {
        let mut rule = selector("Warning", "FailedScheduling", "Pod");
        rule.mode = Some(RemediationMode::Automatic);
        let spec = spec(vec![rule]);

        let matched = match_event(&spec, &event("Warning", "FailedScheduling", "Pod", "db"))
            .expect("selector should match");
        assert_eq!(matched.index, 0);
        assert_eq!(matched.settings.mode, RemediationMode::Automatic);
        assert!((matched.settings.confidence_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(matched.settings.max_risk_level, RiskLevel::Low);
    }

    #[test]
    fn first_matching_selector_wins() {
        let mut first = selector("Warning", "BackOff", "Pod");
        first.max_risk_level = Some(RiskLevel::Medium);
        let mut second = EventSelector {
            event_type: Some("Warning".to_string()),
            ..Default::default()
        };
        second.max_risk_level = Some(RiskLevel::High);
        let spec = spec(vec![first, second]);

        let matched = match_event(&spec, &event("Warning", "BackOff", "Pod", "prod")).unwrap();
        assert_eq!(matched.index, 0);
        assert_eq!(matched.settings.max_risk_level, RiskLevel::Medium);

        // Only the wildcard matches a different reason
        let matched = match_event(&spec, &event("Warning", "Unhealthy", "Pod", "prod")).unwrap();
        assert_eq!(matched.index, 1);
        assert_eq!(matched.settings.max_risk_level, RiskLevel::High);
    }

    #[test]
    fn catch_all_placed_first_shadows_specific_rules() {
        let catch_all = EventSelector {
            event_type: Some("Warning".to_string()),
            ..Default::default()
        };
        let mut specific = selector("Warning", "BackOff", "Pod");
        specific.mode = Some(RemediationMode::Automatic);
        let spec = spec(vec![catch_all, specific]);

        let matched = match_event(&spec, &event("Warning", "BackOff", "Pod", "prod")).unwrap();
        assert_eq!(matched.index, 0);
        assert_eq!(matched.settings.mode, RemediationMode::Manual);
    }

    #[test]
    fn empty_strings_are_wildcards() {
        let rule = EventSelector {
            event_type: Some("Warning".to_string()),
            reason: Some(String::new()),
            involved_object_kind: Some(String::new()),
            namespace: Some(String::new()),
            ..Default::default()
        };
        let spec = spec(vec![rule]);
        assert!(match_event(&spec, &event("Warning", "Evicted", "Node", "")).is_some());
        assert!(match_event(&spec, &event("Normal", "Evicted", "Node", "")).is_none());
    }

    #[test]
    fn namespace_filter_is_exact() {
        let rule = EventSelector {
            namespace: Some("prod".to_string()),
            ..Default::default()
        };
        let spec = spec(vec![rule]);
        assert!(match_event(&spec, &event("Warning", "BackOff", "Pod", "prod")).is_some());
        assert!(match_event(&spec, &event("Warning", "BackOff", "Pod", "production")).is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let spec = spec(vec![selector("Warning", "OOMKilled", "Pod")]);
        assert!(match_event(&spec, &event("Warning", "BackOff", "Pod", "prod")).is_none());
    }
}
