//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the cluster object store
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Unclassified Kubernetes client error (transport, decoding, auth)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create raced with another writer
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Stale resource version on write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The API server rejected the object
    #[error("Invalid object: {0}")]
    Invalid(String),

    /// The API server is throttling or temporarily failing
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Rejected objects and serialization failures are deterministic; everything
    /// else may clear up on a later pass.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClusterError::Invalid(_) | ClusterError::Serialization(_))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}

/// Which kind of write produced an API error. A 409 means different things
/// for a create and for an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verb {
    Read,
    Create,
    Write,
}

/// Classifies a kube error by HTTP status code.
pub(crate) fn classify(err: kube::Error, verb: Verb, what: &str) -> ClusterError {
    let (code, message) = match &err {
        kube::Error::Api(resp) => (resp.code, resp.message.clone()),
        _ => return ClusterError::Kube(err),
    };
    match code {
        404 => ClusterError::NotFound(what.to_string()),
        409 if verb == Verb::Create => ClusterError::AlreadyExists(what.to_string()),
        409 => ClusterError::Conflict(format!("{what}: {message}")),
        400 | 422 => ClusterError::Invalid(format!("{what}: {message}")),
        429 | 500..=599 => ClusterError::Unavailable(format!("{what}: {message}")),
        _ => ClusterError::Kube(err),
    }
}
