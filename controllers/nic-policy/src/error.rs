//! Controller-specific error types.
//!
//! This module defines error types specific to the NIC policy controller
//! that are not covered by upstream library errors.

use crate::render::RenderError;
use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the NIC policy controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object store error surfaced from the cluster client
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Policy spec failed structural validation
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Some nodes still carry labels that must be unwound before the policy can go
    #[error("Node label cleanup incomplete: {0}")]
    NodeLabelCleanup(String),

    /// Finalizer bookkeeping failed
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ControllerError>>),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether the error policy should retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Cluster(e) => e.is_retryable(),
            ControllerError::Render(_) | ControllerError::InvalidConfig(_) => false,
            _ => true,
        }
    }
}
