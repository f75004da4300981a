//! Reconciliation logic for NicClusterPolicy.
//!
//! A pass renders the desired sub-resources, converges them and the managed
//! node labels concurrently, folds the result into a status and decides when
//! to look again:
//! - `resources`: owned DaemonSets and ServiceAccounts
//! - `node_labels`: the two controller-managed node labels
//! - `status`: policy status aggregation

pub mod node_labels;
pub mod resources;
pub mod status;

use crate::backoff::BackoffTracker;
use crate::config::Config;
use crate::error::ControllerError;
use crate::render::{Component, DRIVER_STATE, RenderContext, render};
use cluster_client::{ClusterClient, ResourceKind};
use crds::{NIC_CLUSTER_POLICY_NAME, NicClusterPolicy, NicClusterPolicyStatus, PolicyState};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use node_labels::{DriverPhase, NodeLabelSynchronizer};
use resources::ResourceReconciler;
use status::{PassReport, aggregate};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reconciles NicClusterPolicy resources.
pub struct Reconciler {
    client: Box<dyn ClusterClient>,
    config: Config,
    /// Consecutive transient failures per policy name
    backoff: BackoffTracker,
    /// Last status written per policy (name/uid). Advisory only.
    status_cache: Mutex<HashMap<String, NicClusterPolicyStatus>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn cache_key(policy: &NicClusterPolicy) -> String {
    format!("{}/{}", policy.name_any(), policy.uid().unwrap_or_default())
}

impl Reconciler {
    pub fn new(client: Box<dyn ClusterClient>, config: Config) -> Self {
        let backoff = BackoffTracker::new(config.backoff_min_seconds, config.backoff_max_seconds);
        Self {
            client,
            config,
            backoff,
            status_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one reconciliation pass for a policy.
    ///
    /// Every outcome short of a failed status write is folded into the
    /// status and the returned action; errors are left to the error policy.
    pub async fn reconcile_policy(&self, policy: &NicClusterPolicy) -> Result<Action, ControllerError> {
        let name = policy.name_any();

        if name != NIC_CLUSTER_POLICY_NAME {
            // Never cached: these policies get no finalizer to evict the entry.
            debug!("Ignoring NicClusterPolicy {}: unsupported name", name);
            let status = aggregate(PassReport::Unrecognized, None, false);
            self.write_status(policy, None, status).await?;
            return Ok(Action::await_change());
        }

        let key = cache_key(policy);
        let previous = self.cached_status(&key).or_else(|| policy.status.clone());
        let ctx = RenderContext {
            namespace: self.config.namespace.clone(),
            owner: policy.controller_owner_ref(&()),
        };
        let desired = match render(&policy.spec, &ctx) {
            Ok(desired) => desired,
            Err(err) => {
                warn!("NicClusterPolicy {} is invalid: {}", name, err);
                self.backoff.reset(&name);
                let status = aggregate(PassReport::Invalid(&err), previous.as_ref(), false);
                self.write_status(policy, Some(&key), status).await?;
                return Ok(Action::await_change());
            }
        };

        let phase = if policy.spec.ofed_driver.is_some() {
            DriverPhase::Present {
                fresh: self.driver_freshly_added(previous.as_ref()).await,
            }
        } else {
            DriverPhase::Absent
        };

        let resources = ResourceReconciler::new(self.client.as_ref(), &self.config.namespace);
        let nodes = NodeLabelSynchronizer::new(
            self.client.as_ref(),
            &self.config.nic_discovery_label,
            self.config.node_patch_attempts,
        );
        let (applied, synced) = tokio::join!(resources.reconcile(&desired), nodes.sync(phase));

        let nodes_pending = match &synced {
            Ok(outcome) => !outcome.is_clean(),
            Err(err) => {
                warn!("Failed to list nodes for NicClusterPolicy {}: {}", name, err);
                true
            }
        };
        let transient = nodes_pending
            || match &applied {
                Ok(outcome) => outcome.has_retryable_failures(),
                Err(err) => err.is_retryable(),
            };

        let (retry_in, retries_exhausted) = if transient {
            let (delay, failures) = self.backoff.record_failure(&name);
            let exhausted = failures > self.config.max_transient_retries;
            if exhausted {
                error!(
                    "NicClusterPolicy {} failed {} passes in a row, retrying in {:?}",
                    name, failures, delay
                );
            }
            (Some(delay), exhausted)
        } else {
            self.backoff.reset(&name);
            (None, false)
        };

        let report = match &applied {
            Ok(outcome) => {
                debug!(
                    "NicClusterPolicy {}: {} change(s), {} failure(s)",
                    name,
                    outcome.mutation_count(),
                    outcome.failures.len()
                );
                PassReport::Applied {
                    desired: &desired,
                    outcome,
                }
            }
            Err(err) => {
                warn!("Failed to observe sub-resources of NicClusterPolicy {}: {}", name, err);
                PassReport::Failed(err)
            }
        };
        let status = aggregate(report, previous.as_ref(), retries_exhausted);
        let state = status.state;
        self.write_status(policy, Some(&key), status).await?;

        Ok(match (retry_in, state) {
            (Some(delay), _) => Action::requeue(delay),
            (None, PolicyState::NotReady) => Action::requeue(self.config.not_ready_requeue),
            _ => Action::await_change(),
        })
    }

    /// Releases every node still waiting for a driver before the policy goes.
    ///
    /// Any node left with `wait-for-driver=true` fails the cleanup, so it is
    /// retried and the policy is kept until all of them are released.
    pub async fn cleanup_policy(&self, policy: &NicClusterPolicy) -> Result<Action, ControllerError> {
        let name = policy.name_any();
        info!("NicClusterPolicy {} is being deleted, releasing nodes waiting for the driver", name);

        let nodes = NodeLabelSynchronizer::new(
            self.client.as_ref(),
            &self.config.nic_discovery_label,
            self.config.node_patch_attempts,
        );
        let outcome = nodes.sync(DriverPhase::Absent).await?;
        if !outcome.is_clean() {
            let failed: Vec<&str> = outcome.failures.iter().map(|(node, _)| node.as_str()).collect();
            return Err(ControllerError::NodeLabelCleanup(format!(
                "{} node(s) still waiting for the driver: {}",
                failed.len(),
                failed.join(", ")
            )));
        }

        info!(
            "Released {} node(s) for NicClusterPolicy {}",
            outcome.patched.len(),
            name
        );
        self.backoff.reset(&name);
        self.status_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cache_key(policy));
        Ok(Action::await_change())
    }

    /// Requeue decision for a pass that returned an error.
    ///
    /// Only the recognized policy is tracked for backoff; the others are
    /// retried at the capped delay.
    pub fn error_action(&self, name: &str, error: &ControllerError) -> Action {
        if name != NIC_CLUSTER_POLICY_NAME {
            let delay = Duration::from_secs(self.config.backoff_max_seconds);
            warn!("Failed to mark NicClusterPolicy {} ignored, retrying in {:?}: {}", name, delay, error);
            return Action::requeue(delay);
        }
        let (delay, failures) = self.backoff.record_failure(name);
        if error.is_retryable() {
            warn!(
                "Reconciliation of NicClusterPolicy {} failed ({} in a row), retrying in {:?}: {}",
                name, failures, delay, error
            );
        } else {
            error!("Reconciliation of NicClusterPolicy {} failed, retrying in {:?}: {}", name, delay, error);
        }
        Action::requeue(delay)
    }

    /// Whether the driver was just added to the policy.
    ///
    /// It is not while a known status records `state-OFED` or the driver
    /// DaemonSet already exists; the latter covers a lost status write. When
    /// the DaemonSet cannot be looked up the driver is not treated as fresh,
    /// so a finished node is never gated again on a guess.
    async fn driver_freshly_added(&self, previous: Option<&NicClusterPolicyStatus>) -> bool {
        if previous.and_then(|s| s.applied(DRIVER_STATE)).is_some() {
            return false;
        }
        let workload = Component::OfedDriver.workload_name();
        match self
            .client
            .get(ResourceKind::DaemonSet, &self.config.namespace, workload)
            .await
        {
            Ok(_) => false,
            Err(err) if err.is_not_found() => true,
            Err(err) => {
                warn!("Failed to look up DaemonSet {}: {}", workload, err);
                false
            }
        }
    }

    fn cached_status(&self, key: &str) -> Option<NicClusterPolicyStatus> {
        self.status_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Writes `status` unless the object or the cache already holds it.
    /// Without a cache key only the object is consulted.
    async fn write_status(
        &self,
        policy: &NicClusterPolicy,
        key: Option<&str>,
        status: NicClusterPolicyStatus,
    ) -> Result<(), ControllerError> {
        let name = policy.name_any();
        let cached = key.and_then(|key| self.cached_status(key));
        if policy.status.as_ref() == Some(&status) || cached.as_ref() == Some(&status) {
            debug!("Status of NicClusterPolicy {} unchanged ({})", name, status.state);
            return Ok(());
        }

        self.client.patch_policy_status(&name, &status).await?;
        match &status.detail {
            Some(detail) => info!("NicClusterPolicy {} is {}: {}", name, status.state, detail),
            None => info!("NicClusterPolicy {} is {}", name, status.state),
        }
        if let Some(key) = key {
            self.status_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.to_string(), status);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "policy_test.rs"]
mod policy_test;
