use super::config::ControllerConfig;
use super::metrics::ControllerMetrics;
use super::registry::PolicyRegistry;
use crate::remediation::{KubeOwnerLookup, KubeSecretLookup, Pipeline, ValidationError};
use kube::Client;
use std::sync::Arc;

/// Finalizer placed on every `RemediationPolicy` the controller has registered
pub const POLICY_FINALIZER_NAME: &str = "remediation.platform/finalizer";

/// Error type for controller operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid policy: {0}")]
    Validation(#[from] ValidationError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Pipeline wired to the live cluster
pub type ClusterPipeline = Pipeline<KubeOwnerLookup, KubeSecretLookup>;

/// Context shared by the policy controller and the event watcher
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    /// Namespace the event watcher is scoped to; all namespaces when unset
    pub namespace: Option<String>,
    pub config: Arc<ControllerConfig>,
    pub registry: Arc<PolicyRegistry>,
    pub pipeline: Arc<ClusterPipeline>,
    /// Shared client for webhook notifications
    pub http: reqwest::Client,
    pub metrics: Arc<ControllerMetrics>,
}
