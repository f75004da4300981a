//! ClusterClient trait for mocking
//!
//! This trait abstracts the object store so the reconciler can run against
//! the real API server or an in-memory mock in unit tests.

use crate::error::ClusterError;
use crate::objects::{ResourceKind, ResourceObject};
use crds::NicClusterPolicyStatus;
use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;

/// Object store operations used by the NIC policy controller.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    // Owned sub-resources
    async fn list_owned(&self, kind: ResourceKind, namespace: &str, selector: &str) -> Result<Vec<ResourceObject>, ClusterError>;
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<ResourceObject, ClusterError>;
    /// Creates the object. Fails with [`ClusterError::AlreadyExists`] when it is already present.
    async fn create(&self, object: &ResourceObject) -> Result<ResourceObject, ClusterError>;
    /// Replaces the object. The object's resource version is the precondition.
    async fn replace(&self, object: &ResourceObject) -> Result<ResourceObject, ClusterError>;
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError>;

    // Nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;
    /// Merges `labels` into the node's labels. When `resource_version` is set
    /// the write fails with [`ClusterError::Conflict`] if the node changed since.
    async fn patch_node_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Node, ClusterError>;

    // Policy
    async fn patch_policy_status(&self, name: &str, status: &NicClusterPolicyStatus) -> Result<(), ClusterError>;
}
