//! Node label synchronization.
//!
//! Two node labels belong to this controller: `wait-for-driver` gates staged
//! driver installation and `has-target-nic` marks install candidates. They are
//! only read and written through [`NodeLabels`] and [`LabelPatch`]; every other
//! label on a node is left alone.
//!
//! Each node write carries the node's resource version. When another writer
//! got in first, the node is re-read and the patch recomputed from its fresh
//! labels, so a concurrent update is never overwritten blindly.

use crate::labels::{HAS_TARGET_NIC_LABEL, WAIT_FOR_DRIVER_LABEL};
use cluster_client::{ClusterClient, ClusterError};
use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Node labels owned by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManagedNodeLabel {
    WaitForDriver,
    HasTargetNic,
}

impl ManagedNodeLabel {
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            ManagedNodeLabel::WaitForDriver => WAIT_FOR_DRIVER_LABEL,
            ManagedNodeLabel::HasTargetNic => HAS_TARGET_NIC_LABEL,
        }
    }
}

/// Read-only view over the labels of one node.
#[derive(Debug, Clone, Copy)]
pub struct NodeLabels<'a> {
    labels: Option<&'a BTreeMap<String, String>>,
}

impl<'a> NodeLabels<'a> {
    #[must_use]
    pub fn of(node: &'a Node) -> Self {
        Self {
            labels: node.metadata.labels.as_ref(),
        }
    }

    /// Value of a managed label. Anything other than `true`/`false` reads as absent.
    #[must_use]
    pub fn get(&self, label: ManagedNodeLabel) -> Option<bool> {
        match self.labels?.get(label.key())?.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// Whether hardware discovery reported a target NIC on this node
    #[must_use]
    pub fn nic_discovered(&self, discovery_label: &str) -> bool {
        self.labels
            .and_then(|labels| labels.get(discovery_label))
            .is_some_and(|value| value == "true")
    }
}

/// Managed label values to write to one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelPatch(BTreeMap<ManagedNodeLabel, bool>);

impl LabelPatch {
    pub fn set(&mut self, label: ManagedNodeLabel, value: bool) {
        self.0.insert(label, value);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw label map for the API call
    #[must_use]
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(label, value)| (label.key().to_string(), value.to_string()))
            .collect()
    }
}

/// Whether the policy currently asks for a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    /// `fresh` is set when the driver was just added to the policy.
    Present { fresh: bool },
    Absent,
}

/// Computes the label changes one node needs. Empty when it is already right.
#[must_use]
pub fn desired_patch(node: &Node, phase: DriverPhase, discovery_label: &str) -> LabelPatch {
    let labels = NodeLabels::of(node);
    let wait = labels.get(ManagedNodeLabel::WaitForDriver);
    let mut patch = LabelPatch::default();

    match phase {
        DriverPhase::Present { fresh } => {
            let discovered = labels.nic_discovered(discovery_label);
            let has_nic = labels.get(ManagedNodeLabel::HasTargetNic) == Some(true);
            // Never downgrade has-target-nic: the fact may disappear while the driver is loaded.
            if discovered && !has_nic {
                patch.set(ManagedNodeLabel::HasTargetNic, true);
            }
            if discovered || has_nic {
                match wait {
                    None => patch.set(ManagedNodeLabel::WaitForDriver, true),
                    Some(false) if fresh => patch.set(ManagedNodeLabel::WaitForDriver, true),
                    Some(_) => {}
                }
            }
        }
        DriverPhase::Absent => {
            if wait == Some(true) {
                patch.set(ManagedNodeLabel::WaitForDriver, false);
            }
        }
    }
    patch
}

/// Result of one synchronization sweep.
#[derive(Debug, Default)]
pub struct NodeSyncOutcome {
    pub patched: Vec<String>,
    pub failures: Vec<(String, ClusterError)>,
}

impl NodeSyncOutcome {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives managed node labels toward the state a [`DriverPhase`] calls for.
pub struct NodeLabelSynchronizer<'a> {
    client: &'a dyn ClusterClient,
    discovery_label: &'a str,
    max_attempts: u32,
}

impl<'a> NodeLabelSynchronizer<'a> {
    pub fn new(client: &'a dyn ClusterClient, discovery_label: &'a str, max_attempts: u32) -> Self {
        Self {
            client,
            discovery_label,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Patches every node whose labels disagree with `phase`, concurrently.
    ///
    /// Fails as a whole only when nodes cannot be listed.
    pub async fn sync(&self, phase: DriverPhase) -> Result<NodeSyncOutcome, ClusterError> {
        let nodes = self.client.list_nodes().await?;
        let pending: Vec<&Node> = nodes
            .iter()
            .filter(|node| !desired_patch(node, phase, self.discovery_label).is_empty())
            .collect();
        debug!("{} of {} nodes need label changes ({:?})", pending.len(), nodes.len(), phase);

        let results = join_all(pending.iter().map(|node| self.patch_node(node, phase))).await;

        let mut outcome = NodeSyncOutcome::default();
        for (node, result) in pending.iter().zip(results) {
            let name = node.name_any();
            match result {
                Ok(true) => outcome.patched.push(name),
                Ok(false) => {}
                Err(err) => {
                    warn!("Failed to update labels on node {}: {}", name, err);
                    outcome.failures.push((name, err));
                }
            }
        }
        Ok(outcome)
    }

    /// Applies the patch for one node, re-reading it after each conflict.
    /// Returns whether a write happened; a node that left the cluster is skipped.
    async fn patch_node(&self, node: &Node, phase: DriverPhase) -> Result<bool, ClusterError> {
        let name = node.name_any();
        let mut current = node.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let patch = desired_patch(&current, phase, self.discovery_label);
            if patch.is_empty() {
                return Ok(false);
            }
            let version = current.metadata.resource_version.as_deref();
            match self.client.patch_node_labels(&name, version, &patch.to_labels()).await {
                Ok(_) => {
                    info!("Set {:?} on node {}", patch.to_labels(), name);
                    return Ok(true);
                }
                Err(err) if err.is_not_found() => {
                    debug!("Node {} is gone, skipping", name);
                    return Ok(false);
                }
                Err(err) if err.is_conflict() && attempt < self.max_attempts => {
                    debug!("Node {} changed underneath us (attempt {}), re-reading", name, attempt);
                    current = match self.client.get_node(&name).await {
                        Ok(fresh) => fresh,
                        Err(err) if err.is_not_found() => return Ok(false),
                        Err(err) => return Err(err),
                    };
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
#[path = "node_labels_test.rs"]
mod node_labels_test;
