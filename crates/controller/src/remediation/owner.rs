//! Owner resolution for rate-limit grouping
//!
//! Short-lived Pods created by a recurring CronJob each have a unique name,
//! so grouping on the Pod would never rate-limit anything. The resolver walks
//! Pod -> Job -> CronJob through the API and, once the Pod is already gone,
//! recovers the CronJob name from the Pod name itself.
//!
//! The name heuristic (`<cronjob>-<digits>-<5 alphanumerics>`) can
//! false-positive on a plain Pod whose name happens to have that shape. The
//! behavior is kept as is; a stricter check would silently change grouping.

use super::event::InvolvedObject;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Api, Client};
use std::fmt;
use tracing::{debug, warn};

/// Length of the random suffix Kubernetes appends to generated Pod names.
const RANDOM_SUFFIX_LEN: usize = 5;

/// The workload an event is grouped under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Workload {
    CronJob(String),
    Job(String),
    Pod(String),
    /// Any other kind, stored lowercase
    Other { kind: String, name: String },
}

impl Workload {
    /// Map an involved object's own kind/name without any lookup.
    #[must_use]
    pub fn from_kind(kind: &str, name: &str) -> Self {
        match kind {
            "CronJob" => Self::CronJob(name.to_string()),
            "Job" => Self::Job(name.to_string()),
            "Pod" => Self::Pod(name.to_string()),
            other => Self::Other {
                kind: other.to_ascii_lowercase(),
                name: name.to_string(),
            },
        }
    }

    /// Normalized lowercase kind
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::CronJob(_) => "cronjob",
            Self::Job(_) => "job",
            Self::Pod(_) => "pod",
            Self::Other { kind, .. } => kind,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::CronJob(name) | Self::Job(name) | Self::Pod(name) | Self::Other { name, .. } => {
                name
            }
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// Object kinds the resolver looks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Pod,
    Job,
}

/// Controller owner reference of a looked-up object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerRef {
    pub kind: String,
    pub name: String,
}

/// Result of looking up one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    NotFound,
    /// Object exists; carries its controller owner if it has one
    Found(Option<ControllerRef>),
}

/// API access needed by the resolver.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn controller_of(
        &self,
        kind: LookupKind,
        namespace: &str,
        name: &str,
    ) -> Result<Lookup, kube::Error>;
}

/// `OwnerLookup` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeOwnerLookup {
    client: Client,
}

impl KubeOwnerLookup {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn controller_ref(refs: Option<&Vec<OwnerReference>>) -> Option<ControllerRef> {
    refs?
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| ControllerRef {
            kind: r.kind.clone(),
            name: r.name.clone(),
        })
}

#[async_trait]
impl OwnerLookup for KubeOwnerLookup {
    async fn controller_of(
        &self,
        kind: LookupKind,
        namespace: &str,
        name: &str,
    ) -> Result<Lookup, kube::Error> {
        let owner = match kind {
            LookupKind::Pod => Api::<Pod>::namespaced(self.client.clone(), namespace)
                .get_opt(name)
                .await?
                .map(|pod| controller_ref(pod.metadata.owner_references.as_ref())),
            LookupKind::Job => Api::<Job>::namespaced(self.client.clone(), namespace)
                .get_opt(name)
                .await?
                .map(|job| controller_ref(job.metadata.owner_references.as_ref())),
        };

        Ok(owner.map_or(Lookup::NotFound, Lookup::Found))
    }
}

/// Recover a CronJob name from a Pod name of the form
/// `<cronjob>-<scheduled-time digits>-<5 char suffix>`.
///
/// Returns `None` when the name does not have that shape.
#[must_use]
pub fn parse_cronjob_name(pod_name: &str) -> Option<String> {
    let parts: Vec<&str> = pod_name.split('-').collect();
    if parts.len() < 3 {
        return None;
    }

    let suffix = parts[parts.len() - 1];
    let timestamp = parts[parts.len() - 2];

    let numeric_timestamp = !timestamp.is_empty() && timestamp.bytes().all(|b| b.is_ascii_digit());
    let random_suffix = suffix.len() == RANDOM_SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());

    if !numeric_timestamp || !random_suffix {
        return None;
    }

    let name = parts[..parts.len() - 2].join("-");
    (!name.is_empty()).then_some(name)
}

/// Workload for a Pod whose owners can no longer be read.
fn from_pod_name(pod_name: &str) -> Workload {
    parse_cronjob_name(pod_name).map_or_else(|| Workload::Pod(pod_name.to_string()), Workload::CronJob)
}

/// Resolves involved objects to the workload they belong to.
pub struct OwnerResolver<L> {
    lookup: L,
}

impl<L: OwnerLookup> OwnerResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Resolve the owning workload. Never fails: lookup problems degrade to
    /// the name-based fallback or to the Pod itself.
    pub async fn resolve(&self, object: &InvolvedObject) -> Workload {
        if object.kind != "Pod" {
            return Workload::from_kind(&object.kind, &object.name);
        }

        let pod_name = object.name.as_str();
        let namespace = object.namespace.as_str();

        let pod_owner = match self
            .lookup
            .controller_of(LookupKind::Pod, namespace, pod_name)
            .await
        {
            Ok(Lookup::Found(owner)) => owner,
            Ok(Lookup::NotFound) => {
                let workload = from_pod_name(pod_name);
                debug!(
                    pod = %pod_name,
                    namespace = %namespace,
                    workload = %workload,
                    "Pod already gone, resolved owner from its name"
                );
                return workload;
            }
            Err(e) => {
                warn!(
                    pod = %pod_name,
                    namespace = %namespace,
                    error = %e,
                    "Pod lookup failed, grouping by pod name"
                );
                return Workload::Pod(pod_name.to_string());
            }
        };

        let Some(job) = pod_owner.filter(|owner| owner.kind == "Job") else {
            return Workload::Pod(pod_name.to_string());
        };

        match self
            .lookup
            .controller_of(LookupKind::Job, namespace, &job.name)
            .await
        {
            Ok(Lookup::Found(Some(parent))) if parent.kind == "CronJob" => {
                Workload::CronJob(parent.name)
            }
            Ok(Lookup::Found(_)) => Workload::Job(job.name),
            Ok(Lookup::NotFound) => {
                debug!(job = %job.name, namespace = %namespace, "Job already gone");
                parse_cronjob_name(pod_name).map_or(Workload::Job(job.name), Workload::CronJob)
            }
            Err(e) => {
                warn!(
                    job = %job.name,
                    namespace = %namespace,
                    error = %e,
                    "Job lookup failed, grouping by pod name"
                );
                Workload::Pod(pod_name.to_string())
            }
        }
    }
}
