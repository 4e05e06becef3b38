pub mod remediation_policy;

pub use remediation_policy::{
    EventSelector, Notifications, Persistence, PersistenceStatus, PolicyCondition, RateLimiting,
    RemediationMode, RemediationPolicy, RemediationPolicySpec, RemediationPolicyStatus,
    RiskLevel, SecretKeyRef, WebhookNotification,
};
