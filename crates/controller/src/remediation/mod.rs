//! Event-driven remediation pipeline
//!
//! Leaves first: selector matching, owner resolution, rate-limit keys, the
//! cooldown store and its persistence, the backend dispatcher, notifications
//! and status aggregation. [`pipeline`] ties them together per policy.

pub mod cooldown;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod key;
pub mod notifications;
pub mod owner;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod selector;
pub mod status;

pub use cooldown::{CooldownSnapshot, CooldownStore, FireDecision};
pub use dedup::EventDeduplicator;
pub use dispatcher::{RemediationDispatcher, RemediationRequest, RemediationResponse};
pub use error::{DispatchError, PersistenceError, ResolveError, StatusError, ValidationError};
pub use event::{ClusterEvent, InvolvedObject};
pub use key::RateLimitKey;
pub use notifications::{KubeSecretLookup, PolicyNotifications, SecretLookup};
pub use owner::{KubeOwnerLookup, OwnerLookup, OwnerResolver, Workload};
pub use persistence::{
    ConfigMapSnapshotBackend, InMemorySnapshotBackend, PersistReport, PersistSettings, Persister,
    SnapshotBackend,
};
pub use pipeline::{Disposition, Pipeline, PolicyRuntime};
pub use retry::{Backoff, RetryPolicy, RetryStep};
pub use selector::{match_event, EffectiveSettings, SelectorMatch};
pub use status::{
    InMemoryPolicyStatus, KubePolicyStatusApi, Outcome, PolicyStatusApi, StatusAggregator,
    StatusDelta, StatusLimits,
};
