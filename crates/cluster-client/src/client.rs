//! kube-rs backed [`ClusterClient`]

use crate::error::{ClusterError, Verb, classify};
use crate::objects::{ResourceKind, ResourceObject};
use crate::cluster_trait::ClusterClient;
use crds::{NicClusterPolicy, NicClusterPolicyStatus};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, ServiceAccount};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Cluster client talking to the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn daemonsets(&self, namespace: &str) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn service_accounts(&self, namespace: &str) -> Api<ServiceAccount> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn object_namespace(object: &ResourceObject) -> Result<&str, ClusterError> {
        object
            .namespace()
            .ok_or_else(|| ClusterError::Invalid(format!("{} has no namespace", object.key())))
    }
}

/// Builds the merge patch for the policy status subresource.
///
/// Every field is written explicitly so a cleared `detail` removes the old
/// value instead of being skipped by the merge.
#[must_use]
pub fn policy_status_patch(status: &NicClusterPolicyStatus) -> serde_json::Value {
    serde_json::json!({
        "status": {
            "state": status.state.as_str(),
            "detail": status.detail,
            "appliedStates": status.applied_states,
        }
    })
}

/// Builds the node label merge patch, optionally guarded by a resource version.
#[must_use]
pub fn node_labels_patch(resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "labels": labels });
    if let Some(version) = resource_version {
        metadata["resourceVersion"] = serde_json::Value::String(version.to_string());
    }
    serde_json::json!({ "metadata": metadata })
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_owned(&self, kind: ResourceKind, namespace: &str, selector: &str) -> Result<Vec<ResourceObject>, ClusterError> {
        let params = ListParams::default().labels(selector);
        let what = format!("{kind} in {namespace}");
        let objects = match kind {
            ResourceKind::DaemonSet => self
                .daemonsets(namespace)
                .list(&params)
                .await
                .map_err(|e| classify(e, Verb::Read, &what))?
                .items
                .into_iter()
                .map(ResourceObject::from)
                .collect(),
            ResourceKind::ServiceAccount => self
                .service_accounts(namespace)
                .list(&params)
                .await
                .map_err(|e| classify(e, Verb::Read, &what))?
                .items
                .into_iter()
                .map(ResourceObject::from)
                .collect(),
        };
        Ok(objects)
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<ResourceObject, ClusterError> {
        let what = format!("{kind}/{name}");
        match kind {
            ResourceKind::DaemonSet => self
                .daemonsets(namespace)
                .get(name)
                .await
                .map(ResourceObject::from)
                .map_err(|e| classify(e, Verb::Read, &what)),
            ResourceKind::ServiceAccount => self
                .service_accounts(namespace)
                .get(name)
                .await
                .map(ResourceObject::from)
                .map_err(|e| classify(e, Verb::Read, &what)),
        }
    }

    async fn create(&self, object: &ResourceObject) -> Result<ResourceObject, ClusterError> {
        let namespace = Self::object_namespace(object)?;
        let what = object.key().to_string();
        debug!("Creating {} in {}", what, namespace);
        let params = PostParams::default();
        match object {
            ResourceObject::DaemonSet(ds) => self
                .daemonsets(namespace)
                .create(&params, ds.as_ref())
                .await
                .map(ResourceObject::from)
                .map_err(|e| classify(e, Verb::Create, &what)),
            ResourceObject::ServiceAccount(sa) => self
                .service_accounts(namespace)
                .create(&params, sa)
                .await
                .map(ResourceObject::from)
                .map_err(|e| classify(e, Verb::Create, &what)),
        }
    }

    async fn replace(&self, object: &ResourceObject) -> Result<ResourceObject, ClusterError> {
        let namespace = Self::object_namespace(object)?;
        let what = object.key().to_string();
        debug!("Replacing {} in {}", what, namespace);
        let params = PostParams::default();
        match object {
            ResourceObject::DaemonSet(ds) => self
                .daemonsets(namespace)
                .replace(object.name(), &params, ds.as_ref())
                .await
                .map(ResourceObject::from)
                .map_err(|e| classify(e, Verb::Write, &what)),
            ResourceObject::ServiceAccount(sa) => self
                .service_accounts(namespace)
                .replace(object.name(), &params, sa)
                .await
                .map(ResourceObject::from)
                .map_err(|e| classify(e, Verb::Write, &what)),
        }
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let what = format!("{kind}/{name}");
        debug!("Deleting {} in {}", what, namespace);
        let params = DeleteParams::background();
        match kind {
            ResourceKind::DaemonSet => self
                .daemonsets(namespace)
                .delete(name, &params)
                .await
                .map(|_| ())
                .map_err(|e| classify(e, Verb::Write, &what)),
            ResourceKind::ServiceAccount => self
                .service_accounts(namespace)
                .delete(name, &params)
                .await
                .map(|_| ())
                .map_err(|e| classify(e, Verb::Write, &what)),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        self.nodes()
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(|e| classify(e, Verb::Read, "nodes"))
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.nodes()
            .get(name)
            .await
            .map_err(|e| classify(e, Verb::Read, &format!("Node/{name}")))
    }

    async fn patch_node_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Node, ClusterError> {
        let patch = node_labels_patch(resource_version, labels);
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify(e, Verb::Write, &format!("Node/{name}")))
    }

    async fn patch_policy_status(&self, name: &str, status: &NicClusterPolicyStatus) -> Result<(), ClusterError> {
        let api: Api<NicClusterPolicy> = Api::all(self.client.clone());
        let patch = policy_status_patch(status);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| classify(e, Verb::Write, &format!("NicClusterPolicy/{name}")))
    }
}
