//! Mock ClusterClient for unit testing
//!
//! This module provides an in-memory implementation of [`ClusterClient`] that
//! can be used in unit tests without a running API server. It keeps resource
//! versions so optimistic concurrency behaves like the real thing, records
//! every mutation, and can be told to fail specific operations.

use crate::cluster_trait::ClusterClient;
use crate::error::ClusterError;
use crate::objects::{ObjectKey, ResourceKind, ResourceObject};
use crds::NicClusterPolicyStatus;
use k8s_openapi::api::apps::v1::DaemonSetStatus;
use k8s_openapi::api::core::v1::Node;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOperation {
    List,
    Get,
    Create,
    Replace,
    Delete,
    ListNodes,
    GetNode,
    PatchNode,
    PatchStatus,
}

/// Failure returned by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Conflict,
    Unavailable,
    Invalid,
    NotFound,
}

impl MockFailure {
    fn to_error(self, target: &str) -> ClusterError {
        match self {
            MockFailure::Conflict => ClusterError::Conflict(format!("injected conflict on {target}")),
            MockFailure::Unavailable => ClusterError::Unavailable(format!("injected outage on {target}")),
            MockFailure::Invalid => ClusterError::Invalid(format!("injected rejection of {target}")),
            MockFailure::NotFound => ClusterError::NotFound(target.to_string()),
        }
    }
}

/// A write observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockMutation {
    Create(ObjectKey),
    Replace(ObjectKey),
    Delete(ObjectKey),
    PatchNode(String),
    PatchStatus(String),
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    operation: MockOperation,
    /// Object/node name, or kind name for listings. `None` matches any target.
    target: Option<String>,
    remaining: u32,
    failure: MockFailure,
}

type ObjectStore = BTreeMap<(String, ObjectKey), ResourceObject>;

/// Mock ClusterClient for testing
///
/// Clones share the same state, so a test can hand one clone to the code
/// under test and inspect the other.
#[derive(Clone, Default)]
pub struct MockClusterClient {
    objects: Arc<Mutex<ObjectStore>>,
    nodes: Arc<Mutex<BTreeMap<String, Node>>>,
    policy_statuses: Arc<Mutex<HashMap<String, NicClusterPolicyStatus>>>,
    failures: Arc<Mutex<Vec<InjectedFailure>>>,
    mutations: Arc<Mutex<Vec<MockMutation>>>,
    next_version: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Matches `key` (exists) and `key=value` terms separated by commas.
fn selector_matches(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector.split(',').map(str::trim).filter(|term| !term.is_empty()).all(|term| {
        let Some(labels) = labels else {
            return false;
        };
        match term.split_once('=') {
            Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
            None => labels.contains_key(term),
        }
    })
}

impl MockClusterClient {
    /// Create a new, empty mock client
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        let mut version = lock(&self.next_version);
        *version += 1;
        version.to_string()
    }

    fn record(&self, mutation: MockMutation) {
        lock(&self.mutations).push(mutation);
    }

    fn take_failure(&self, operation: MockOperation, target: &str) -> Result<(), ClusterError> {
        let mut failures = lock(&self.failures);
        let found = failures.iter_mut().find(|f| {
            f.operation == operation && f.remaining > 0 && f.target.as_deref().is_none_or(|t| t == target)
        });
        match found {
            Some(injected) => {
                injected.remaining -= 1;
                Err(injected.failure.to_error(target))
            }
            None => Ok(()),
        }
    }

    /// Make the next `times` calls of `operation` against `target` fail.
    pub fn fail(&self, operation: MockOperation, target: Option<&str>, times: u32, failure: MockFailure) {
        lock(&self.failures).push(InjectedFailure {
            operation,
            target: target.map(ToString::to_string),
            remaining: times,
            failure,
        });
    }

    /// Add a node to the mock store (for test setup)
    pub fn add_node(&self, mut node: Node) {
        node.metadata.resource_version = Some(self.next_version());
        let name = node.metadata.name.clone().unwrap_or_default();
        lock(&self.nodes).insert(name, node);
    }

    /// Remove a node, as if it left the cluster
    pub fn remove_node(&self, name: &str) {
        lock(&self.nodes).remove(name);
    }

    /// Set a node label as an external writer would, bumping the node's resource version
    pub fn set_node_label(&self, name: &str, key: &str, value: &str) {
        let version = self.next_version();
        if let Some(node) = lock(&self.nodes).get_mut(name) {
            node.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(key.to_string(), value.to_string());
            node.metadata.resource_version = Some(version);
        }
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<Node> {
        lock(&self.nodes).get(name).cloned()
    }

    /// Label value on a stored node
    #[must_use]
    pub fn node_label(&self, name: &str, key: &str) -> Option<String> {
        lock(&self.nodes)
            .get(name)?
            .metadata
            .labels
            .as_ref()?
            .get(key)
            .cloned()
    }

    /// Insert an object as an external writer would (for test setup)
    pub fn insert_object(&self, namespace: &str, mut object: ResourceObject) {
        object.set_resource_version(Some(self.next_version()));
        object.meta_mut().namespace = Some(namespace.to_string());
        lock(&self.objects).insert((namespace.to_string(), object.key()), object);
    }

    #[must_use]
    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<ResourceObject> {
        let key = ObjectKey {
            kind,
            name: name.to_string(),
        };
        lock(&self.objects).get(&(namespace.to_string(), key)).cloned()
    }

    /// All stored objects in a namespace, sorted by key
    #[must_use]
    pub fn objects(&self, namespace: &str) -> Vec<ResourceObject> {
        lock(&self.objects)
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, object)| object.clone())
            .collect()
    }

    /// Overwrite a DaemonSet's status, as its controller would
    pub fn set_daemonset_status(&self, namespace: &str, name: &str, status: DaemonSetStatus) {
        let version = self.next_version();
        let key = ObjectKey {
            kind: ResourceKind::DaemonSet,
            name: name.to_string(),
        };
        if let Some(ResourceObject::DaemonSet(ds)) = lock(&self.objects).get_mut(&(namespace.to_string(), key)) {
            ds.status = Some(status);
            ds.metadata.resource_version = Some(version);
        }
    }

    #[must_use]
    pub fn policy_status(&self, name: &str) -> Option<NicClusterPolicyStatus> {
        lock(&self.policy_statuses).get(name).cloned()
    }

    /// Writes observed since creation or the last [`Self::clear_mutations`]
    #[must_use]
    pub fn mutations(&self) -> Vec<MockMutation> {
        lock(&self.mutations).clone()
    }

    pub fn clear_mutations(&self) {
        lock(&self.mutations).clear();
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn list_owned(&self, kind: ResourceKind, namespace: &str, selector: &str) -> Result<Vec<ResourceObject>, ClusterError> {
        self.take_failure(MockOperation::List, &kind.to_string())?;
        Ok(lock(&self.objects)
            .iter()
            .filter(|((ns, key), object)| {
                ns == namespace && key.kind == kind && selector_matches(object.meta().labels.as_ref(), selector)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<ResourceObject, ClusterError> {
        self.take_failure(MockOperation::Get, name)?;
        self.object(kind, namespace, name)
            .ok_or_else(|| ClusterError::NotFound(format!("{kind}/{name}")))
    }

    async fn create(&self, object: &ResourceObject) -> Result<ResourceObject, ClusterError> {
        self.take_failure(MockOperation::Create, object.name())?;
        let namespace = object.namespace().unwrap_or_default().to_string();
        let key = object.key();
        let mut objects = lock(&self.objects);
        if objects.contains_key(&(namespace.clone(), key.clone())) {
            return Err(ClusterError::AlreadyExists(key.to_string()));
        }
        let mut stored = object.clone();
        stored.set_resource_version(Some(self.next_version()));
        objects.insert((namespace, key.clone()), stored.clone());
        drop(objects);
        self.record(MockMutation::Create(key));
        Ok(stored)
    }

    async fn replace(&self, object: &ResourceObject) -> Result<ResourceObject, ClusterError> {
        self.take_failure(MockOperation::Replace, object.name())?;
        let namespace = object.namespace().unwrap_or_default().to_string();
        let key = object.key();
        let mut objects = lock(&self.objects);
        let Some(current) = objects.get(&(namespace.clone(), key.clone())) else {
            return Err(ClusterError::NotFound(key.to_string()));
        };
        if object.resource_version().is_some() && object.resource_version() != current.resource_version() {
            return Err(ClusterError::Conflict(format!("{key} was modified")));
        }
        let mut stored = object.clone();
        // Status belongs to the status subresource and survives a replace.
        if let (ResourceObject::DaemonSet(new), ResourceObject::DaemonSet(old)) = (&mut stored, current) {
            new.status.clone_from(&old.status);
        }
        stored.set_resource_version(Some(self.next_version()));
        objects.insert((namespace, key.clone()), stored.clone());
        drop(objects);
        self.record(MockMutation::Replace(key));
        Ok(stored)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.take_failure(MockOperation::Delete, name)?;
        let key = ObjectKey {
            kind,
            name: name.to_string(),
        };
        if lock(&self.objects).remove(&(namespace.to_string(), key.clone())).is_none() {
            return Err(ClusterError::NotFound(key.to_string()));
        }
        self.record(MockMutation::Delete(key));
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        self.take_failure(MockOperation::ListNodes, "nodes")?;
        Ok(lock(&self.nodes).values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.take_failure(MockOperation::GetNode, name)?;
        self.node(name)
            .ok_or_else(|| ClusterError::NotFound(format!("Node/{name}")))
    }

    async fn patch_node_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Node, ClusterError> {
        self.take_failure(MockOperation::PatchNode, name)?;
        let version = self.next_version();
        let mut nodes = lock(&self.nodes);
        let Some(node) = nodes.get_mut(name) else {
            return Err(ClusterError::NotFound(format!("Node/{name}")));
        };
        if resource_version.is_some() && resource_version != node.metadata.resource_version.as_deref() {
            return Err(ClusterError::Conflict(format!("Node/{name} was modified")));
        }
        node.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        node.metadata.resource_version = Some(version);
        let patched = node.clone();
        drop(nodes);
        self.record(MockMutation::PatchNode(name.to_string()));
        Ok(patched)
    }

    async fn patch_policy_status(&self, name: &str, status: &NicClusterPolicyStatus) -> Result<(), ClusterError> {
        self.take_failure(MockOperation::PatchStatus, name)?;
        lock(&self.policy_statuses).insert(name.to_string(), status.clone());
        self.record(MockMutation::PatchStatus(name.to_string()));
        Ok(())
    }
}
