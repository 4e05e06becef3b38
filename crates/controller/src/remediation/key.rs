//! Rate-limit key derivation

use super::owner::Workload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `policyNamespace/policyName/objectNamespace/ownerKind:ownerName/reason`
///
/// Two events resolved to the same owner under the same policy and reason
/// share a key, whichever way the owner was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    #[must_use]
    pub fn new(
        policy_namespace: &str,
        policy_name: &str,
        object_namespace: &str,
        owner: &Workload,
        reason: &str,
    ) -> Self {
        Self(format!(
            "{policy_namespace}/{policy_name}/{object_namespace}/{}:{}/{reason}",
            owner.kind(),
            owner.name()
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RateLimitKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for RateLimitKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}
