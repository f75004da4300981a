//! Kubernetes resource watchers.
//!
//! Drives reconciliation with `kube_runtime::Controller`. The policy is
//! watched directly; owned DaemonSets and ServiceAccounts and relevant Nodes
//! map back to the one recognized policy. The controller's scheduler is the
//! work queue: triggers for the same policy collapse into one pending pass
//! and at most one pass per policy runs at a time.

use crate::config::Config;
use crate::error::ControllerError;
use crate::labels::{NODE_LABEL_CLEANUP_FINALIZER, owned_selector};
use crate::reconciler::Reconciler;
use crate::reconciler::node_labels::{ManagedNodeLabel, NodeLabels};
use crds::{NIC_CLUSTER_POLICY_NAME, NicClusterPolicy};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, ServiceAccount};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::finalizer::{Error as FinalizerError, Event, finalizer};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Shared state handed to every reconcile call.
struct Context {
    reconciler: Arc<Reconciler>,
    policies: Api<NicClusterPolicy>,
}

/// Wraps a pass in the node label cleanup finalizer.
///
/// Policies with an unsupported name never get the finalizer: they are only
/// marked `Ignore` and have nothing to clean up.
async fn reconcile(policy: Arc<NicClusterPolicy>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let name = policy.name_any();
    debug!("Reconciling NicClusterPolicy {}", name);

    if name != NIC_CLUSTER_POLICY_NAME {
        return ctx.reconciler.reconcile_policy(&policy).await;
    }

    let reconciler = Arc::clone(&ctx.reconciler);
    finalizer(&ctx.policies, NODE_LABEL_CLEANUP_FINALIZER, policy, |event| async move {
        match event {
            Event::Apply(policy) => reconciler.reconcile_policy(&policy).await,
            Event::Cleanup(policy) => reconciler.cleanup_policy(&policy).await,
        }
    })
    .await
    .map_err(|err| match err {
        FinalizerError::ApplyFailed(err) | FinalizerError::CleanupFailed(err) => err,
        other => ControllerError::Finalizer(Box::new(other)),
    })
}

fn error_policy(policy: Arc<NicClusterPolicy>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    ctx.reconciler.error_action(&policy.name_any(), error)
}

/// Maps a Node event to the recognized policy when the node matters to it:
/// hardware discovery reported a target NIC, or it carries a managed label.
fn node_trigger(node: &Node, discovery_label: &str) -> Option<ObjectRef<NicClusterPolicy>> {
    let labels = NodeLabels::of(node);
    let relevant = labels.nic_discovered(discovery_label)
        || labels.get(ManagedNodeLabel::WaitForDriver).is_some()
        || labels.get(ManagedNodeLabel::HasTargetNic).is_some();
    relevant.then(|| ObjectRef::new(NIC_CLUSTER_POLICY_NAME))
}

/// Watches NicClusterPolicy and everything that feeds into it.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    policy_api: Api<NicClusterPolicy>,
    daemonset_api: Api<DaemonSet>,
    service_account_api: Api<ServiceAccount>,
    node_api: Api<Node>,
    config: Config,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(client: &Client, reconciler: Arc<Reconciler>, config: Config) -> Self {
        Self {
            reconciler,
            policy_api: Api::all(client.clone()),
            daemonset_api: Api::namespaced(client.clone(), &config.namespace),
            service_account_api: Api::namespaced(client.clone(), &config.namespace),
            node_api: Api::all(client.clone()),
            config,
        }
    }

    /// Runs the policy controller until a shutdown signal arrives.
    pub async fn watch_policies(&self) -> Result<(), ControllerError> {
        info!("Starting NicClusterPolicy watcher");

        let owned = watcher::Config::default().labels(&owned_selector());
        let discovery_label = self.config.nic_discovery_label.clone();
        let ctx = Arc::new(Context {
            reconciler: Arc::clone(&self.reconciler),
            policies: self.policy_api.clone(),
        });
        let controller_config = ControllerConfig::default().debounce(self.config.debounce);

        Controller::new(self.policy_api.clone(), watcher::Config::default())
            .owns(self.daemonset_api.clone(), owned.clone())
            .owns(self.service_account_api.clone(), owned)
            .watches(self.node_api.clone(), watcher::Config::default(), move |node| {
                node_trigger(&node, &discovery_label)
            })
            .with_config(controller_config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((policy, action)) => debug!("Reconciled NicClusterPolicy {}: {:?}", policy.name, action),
                    Err(e) => error!("NicClusterPolicy controller error: {}", e),
                }
            })
            .await;

        info!("NicClusterPolicy watcher stopped");
        Ok(())
    }
}
