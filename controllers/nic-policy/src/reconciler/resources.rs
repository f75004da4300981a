//! Owned sub-resource reconciliation.
//!
//! Lists the DaemonSets and ServiceAccounts this controller owns, diffs them
//! against the rendered set by spec hash and rendered fields, and converges: creates first, then
//! updates, then deletes. One object failing does not stop the others.

use crate::labels::{SPEC_HASH_ANNOTATION, STATE_LABEL, owned_selector};
use crate::render::DesiredResource;
use cluster_client::{ClusterClient, ClusterError, ObjectKey, ResourceKind, ResourceObject};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What a pass has to do, computed from desired and live state alone.
#[derive(Debug, Default)]
pub struct ApplyPlan {
    pub create: Vec<ResourceObject>,
    /// Desired object paired with the live object it replaces
    pub update: Vec<(ResourceObject, ResourceObject)>,
    pub delete: Vec<ResourceObject>,
    pub unchanged: Vec<ResourceObject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Create,
    Update,
    Delete,
}

/// One object that could not be converged this pass.
#[derive(Debug)]
pub struct ApplyFailure {
    pub key: ObjectKey,
    /// State label of the object, if it had one
    pub state: Option<String>,
    pub action: ApplyAction,
    pub error: ClusterError,
}

/// Result of applying a plan.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub created: Vec<ObjectKey>,
    pub updated: Vec<ObjectKey>,
    pub deleted: Vec<ObjectKey>,
    pub failures: Vec<ApplyFailure>,
    /// Desired objects as they exist in the cluster after the pass
    pub live: BTreeMap<ObjectKey, ResourceObject>,
}

impl ApplyOutcome {
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    #[must_use]
    pub fn has_retryable_failures(&self) -> bool {
        self.failures.iter().any(|f| f.error.is_retryable())
    }

    fn fail(&mut self, object: &ResourceObject, action: ApplyAction, error: ClusterError) {
        warn!("Failed to {:?} {}: {}", action, object.key(), error);
        self.failures.push(ApplyFailure {
            key: object.key(),
            state: object.label(STATE_LABEL).map(str::to_string),
            action,
            error,
        });
    }
}

/// Whether the live object drifted from the rendered one.
///
/// A different spec hash is drift. With the same hash, the fields the
/// controller renders are still compared, so an edit that left the annotation
/// alone is repaired too. Fields the API server fills in are not compared.
#[must_use]
pub fn needs_update(desired: &ResourceObject, live: &ResourceObject) -> bool {
    if desired.annotation(SPEC_HASH_ANNOTATION) != live.annotation(SPEC_HASH_ANNOTATION) {
        return true;
    }
    if !metadata_retained(desired.meta(), live.meta()) {
        return true;
    }
    match (desired, live) {
        (ResourceObject::DaemonSet(want), ResourceObject::DaemonSet(have)) => daemonset_drifted(want, have),
        (ResourceObject::ServiceAccount(_), ResourceObject::ServiceAccount(_)) => false,
        _ => true,
    }
}

/// Every label in `want` is present with the same value in `have`.
fn contains_all(want: Option<&BTreeMap<String, String>>, have: Option<&BTreeMap<String, String>>) -> bool {
    want.into_iter()
        .flatten()
        .all(|(key, value)| have.and_then(|labels| labels.get(key)) == Some(value))
}

/// Rendered labels and owner references are still on the live object.
fn metadata_retained(want: &ObjectMeta, have: &ObjectMeta) -> bool {
    let owners_kept = want
        .owner_references
        .iter()
        .flatten()
        .all(|owner| have.owner_references.iter().flatten().any(|o| o.uid == owner.uid));
    owners_kept && contains_all(want.labels.as_ref(), have.labels.as_ref())
}

/// Rendered pod-level fields of a DaemonSet.
#[derive(Debug, PartialEq)]
struct WorkloadFields<'a> {
    selector: Option<&'a BTreeMap<String, String>>,
    service_account: Option<&'a str>,
    host_network: bool,
    node_selector: Option<&'a BTreeMap<String, String>>,
    tolerations: Option<&'a Vec<Toleration>>,
    pull_secrets: Option<&'a Vec<LocalObjectReference>>,
    priority_class: Option<&'a str>,
    host_paths: Vec<(&'a str, Option<&'a str>)>,
    containers: Vec<ContainerFields<'a>>,
}

#[derive(Debug, PartialEq)]
struct ContainerFields<'a> {
    name: &'a str,
    image: Option<&'a str>,
    pull_policy: Option<&'a str>,
    env: Vec<(&'a str, &'a str)>,
    privileged: bool,
    mounts: Vec<(&'a str, &'a str)>,
}

impl<'a> WorkloadFields<'a> {
    fn of(spec: &'a DaemonSetSpec) -> Self {
        let pod = spec.template.spec.as_ref();
        Self {
            selector: spec.selector.match_labels.as_ref(),
            service_account: pod.and_then(|p| p.service_account_name.as_deref()),
            host_network: pod.and_then(|p| p.host_network).unwrap_or(false),
            node_selector: pod.and_then(|p| p.node_selector.as_ref()).filter(|m| !m.is_empty()),
            tolerations: pod.and_then(|p| p.tolerations.as_ref()),
            pull_secrets: pod.and_then(|p| p.image_pull_secrets.as_ref()).filter(|s| !s.is_empty()),
            priority_class: pod.and_then(|p| p.priority_class_name.as_deref()),
            host_paths: pod
                .and_then(|p| p.volumes.as_ref())
                .into_iter()
                .flatten()
                .map(|v| (v.name.as_str(), v.host_path.as_ref().map(|h| h.path.as_str())))
                .collect(),
            containers: pod
                .map(|p| p.containers.iter().map(ContainerFields::of).collect())
                .unwrap_or_default(),
        }
    }
}

impl<'a> ContainerFields<'a> {
    fn of(container: &'a Container) -> Self {
        Self {
            name: &container.name,
            image: container.image.as_deref(),
            pull_policy: container.image_pull_policy.as_deref(),
            env: container
                .env
                .iter()
                .flatten()
                .map(|var| (var.name.as_str(), var.value.as_deref().unwrap_or_default()))
                .collect(),
            privileged: container
                .security_context
                .as_ref()
                .and_then(|sc| sc.privileged)
                .unwrap_or(false),
            mounts: container
                .volume_mounts
                .iter()
                .flatten()
                .map(|m| (m.name.as_str(), m.mount_path.as_str()))
                .collect(),
        }
    }
}

fn template_labels(spec: &DaemonSetSpec) -> Option<&BTreeMap<String, String>> {
    spec.template.metadata.as_ref().and_then(|m| m.labels.as_ref())
}

fn daemonset_drifted(desired: &DaemonSet, live: &DaemonSet) -> bool {
    let (Some(want), Some(have)) = (desired.spec.as_ref(), live.spec.as_ref()) else {
        return desired.spec.is_some();
    };
    // The API server defaults the strategy, so only a rendered one is compared.
    let strategy_kept = want.update_strategy.as_ref().is_none_or(|strategy| {
        have.update_strategy.as_ref().and_then(|s| s.type_.as_deref()) == strategy.type_.as_deref()
    });
    WorkloadFields::of(want) != WorkloadFields::of(have)
        || !contains_all(template_labels(want), template_labels(have))
        || !strategy_kept
}

/// Partitions desired and live objects into create/update/delete/unchanged.
///
/// Every live object passed in is owned (it came from the owned selector), so
/// anything left over after matching desired keys is deleted. Deletes run
/// workloads first, then their identities.
#[must_use]
pub fn plan(desired: &[DesiredResource], live: Vec<ResourceObject>) -> ApplyPlan {
    let mut live_by_key: BTreeMap<ObjectKey, ResourceObject> =
        live.into_iter().map(|object| (object.key(), object)).collect();
    let mut plan = ApplyPlan::default();

    for resource in desired {
        match live_by_key.remove(&resource.object.key()) {
            None => plan.create.push(resource.object.clone()),
            Some(current) if needs_update(&resource.object, &current) => {
                plan.update.push((resource.object.clone(), current));
            }
            Some(current) => plan.unchanged.push(current),
        }
    }

    plan.delete = live_by_key.into_values().collect();
    plan.delete.sort_by_key(|object| (Reverse(object.kind()), object.name().to_string()));
    plan
}

/// Converges owned objects in one namespace.
pub struct ResourceReconciler<'a> {
    client: &'a dyn ClusterClient,
    namespace: &'a str,
}

impl<'a> ResourceReconciler<'a> {
    pub fn new(client: &'a dyn ClusterClient, namespace: &'a str) -> Self {
        Self { client, namespace }
    }

    /// Runs one reconcile pass. Only a failure to observe live state fails the
    /// pass as a whole; per-object failures are reported in the outcome.
    pub async fn reconcile(&self, desired: &[DesiredResource]) -> Result<ApplyOutcome, ClusterError> {
        let selector = owned_selector();
        let mut live = Vec::new();
        for kind in ResourceKind::ALL {
            live.extend(self.client.list_owned(kind, self.namespace, &selector).await?);
        }

        let plan = plan(desired, live);
        debug!(
            "Plan for {}: {} to create, {} to update, {} to delete, {} unchanged",
            self.namespace,
            plan.create.len(),
            plan.update.len(),
            plan.delete.len(),
            plan.unchanged.len()
        );

        let mut outcome = ApplyOutcome::default();
        for current in plan.unchanged {
            outcome.live.insert(current.key(), current);
        }
        for object in plan.create {
            self.create(object, &mut outcome).await;
        }
        for (object, current) in plan.update {
            self.update(object, &current, &mut outcome).await;
        }
        for object in plan.delete {
            self.delete(&object, &mut outcome).await;
        }
        Ok(outcome)
    }

    async fn create(&self, object: ResourceObject, outcome: &mut ApplyOutcome) {
        let key = object.key();
        match self.client.create(&object).await {
            Ok(created) => {
                info!("Created {} in {}", key, self.namespace);
                outcome.created.push(key.clone());
                outcome.live.insert(key, created);
            }
            Err(ClusterError::AlreadyExists(_)) => {
                // Another writer got there first; converge on what it left.
                match self.client.get(key.kind, self.namespace, &key.name).await {
                    Ok(current) if !needs_update(&object, &current) => {
                        debug!("{} already exists with the desired spec", key);
                        outcome.live.insert(key, current);
                    }
                    Ok(current) => self.update(object, &current, outcome).await,
                    Err(err) => outcome.fail(&object, ApplyAction::Create, err),
                }
            }
            Err(err) => outcome.fail(&object, ApplyAction::Create, err),
        }
    }

    async fn update(&self, mut object: ResourceObject, current: &ResourceObject, outcome: &mut ApplyOutcome) {
        let key = object.key();
        object.set_resource_version(current.resource_version().map(str::to_string));
        match self.client.replace(&object).await {
            Ok(replaced) => {
                info!("Updated {} in {}", key, self.namespace);
                outcome.updated.push(key.clone());
                outcome.live.insert(key, replaced);
            }
            Err(err) => outcome.fail(&object, ApplyAction::Update, err),
        }
    }

    async fn delete(&self, object: &ResourceObject, outcome: &mut ApplyOutcome) {
        let key = object.key();
        match self.client.delete(key.kind, self.namespace, &key.name).await {
            Ok(()) => {
                info!("Deleted {} from {}", key, self.namespace);
                outcome.deleted.push(key);
            }
            Err(err) if err.is_not_found() => debug!("{} was already gone", key),
            Err(err) => outcome.fail(object, ApplyAction::Delete, err),
        }
    }
}

#[cfg(test)]
#[path = "resources_test.rs"]
mod resources_test;
