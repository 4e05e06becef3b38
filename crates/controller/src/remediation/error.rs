//! Error types for the remediation pipeline

use thiserror::Error;

/// Failures resolving a value out of a Secret
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("secret {name} has no key {key}")]
    KeyMissing { name: String, key: String },

    #[error("secret {name} key {key} is empty")]
    EmptyValue { name: String, key: String },

    #[error("secret {name} key {key} is not valid UTF-8")]
    InvalidUtf8 { name: String, key: String },

    #[error("secret lookup failed: {0}")]
    Api(#[from] kube::Error),
}

impl ResolveError {
    /// Short machine-readable reason for status conditions
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SecretNotFound { .. } => "SecretNotFound",
            Self::KeyMissing { .. } => "SecretKeyMissing",
            Self::EmptyValue { .. } => "SecretValueEmpty",
            Self::InvalidUtf8 { .. } => "SecretValueInvalid",
            Self::Api(_) => "SecretLookupFailed",
        }
    }
}

/// Backend call failures
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend reported failure: {0}")]
    Rejected(String),

    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    #[error("credential unavailable: {0}")]
    Credential(#[from] ResolveError),
}

impl DispatchError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            Self::Rejected(_) | Self::MalformedResponse(_) | Self::Credential(_) => false,
        }
    }
}

/// 5xx plus the transient 4xx subset.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500..=599)
}

/// Snapshot storage failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot exceeds storage size limit: {0}")]
    TooLarge(String),

    #[error("storage API error: {0}")]
    Api(#[source] kube::Error),

    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored snapshot is corrupt: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    #[must_use]
    pub fn is_too_large(&self) -> bool {
        matches!(self, Self::TooLarge(_))
    }
}

impl From<kube::Error> for PersistenceError {
    fn from(err: kube::Error) -> Self {
        if let kube::Error::Api(response) = &err {
            let message = response.message.to_ascii_lowercase();
            if response.code == 413
                || response.reason == "RequestEntityTooLarge"
                || message.contains("too large")
                || message.contains("too long")
                || message.contains("exceeds")
            {
                return Self::TooLarge(response.message.clone());
            }
        }
        Self::Api(err)
    }
}

/// Policy status write failures
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status write failed: {0}")]
    Api(#[from] kube::Error),

    #[error("status write still conflicting after {0} attempts")]
    ConflictRetriesExhausted(u32),

    #[error("policy no longer exists")]
    PolicyGone,
}

/// Reasons a policy is rejected at reconcile time
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("eventSelectors must not be empty")]
    NoSelectors,

    #[error("eventSelectors[{index}].type must be Warning or Normal, got {value}")]
    InvalidEventType { index: usize, value: String },

    #[error("{field} must be within 0.0..=1.0, got {value}")]
    ConfidenceOutOfRange { field: String, value: f64 },

    #[error("remediationEndpoint must be an http(s) URL, got {0:?}")]
    InvalidEndpoint(String),

    #[error("{field} must not be empty")]
    EmptyField { field: String },
}

impl ValidationError {
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoSelectors => "NoSelectors",
            Self::InvalidEventType { .. } => "InvalidEventType",
            Self::ConfidenceOutOfRange { .. } => "InvalidConfidence",
            Self::InvalidEndpoint(_) => "InvalidEndpoint",
            Self::EmptyField { .. } => "MissingField",
        }
    }
}
