//! Status aggregation.
//!
//! Folds the outcome of one pass into the externally visible policy status.
//! The result depends only on its inputs, so it is recomputed every pass and
//! compared with the last written status to decide whether to write.

use super::resources::{ApplyFailure, ApplyOutcome};
use crate::render::{DesiredResource, RenderError};
use cluster_client::{ClusterError, ResourceObject};
use crds::{AppliedState, NIC_CLUSTER_POLICY_NAME, NicClusterPolicyStatus, PolicyState};
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::ResourceExt;

/// What one pass produced, as far as status is concerned.
#[derive(Debug, Clone, Copy)]
pub enum PassReport<'a> {
    /// The policy does not carry the recognized name
    Unrecognized,
    /// The spec is structurally invalid
    Invalid(&'a RenderError),
    /// Live state could not be observed, so nothing was applied
    Failed(&'a ClusterError),
    Applied {
        desired: &'a [DesiredResource],
        outcome: &'a ApplyOutcome,
    },
}

/// Computes the policy status for a pass.
///
/// `retries_exhausted` is set once consecutive transient failures ran past
/// the retry budget; from then on they count as `Error`.
#[must_use]
pub fn aggregate(
    report: PassReport<'_>,
    previous: Option<&NicClusterPolicyStatus>,
    retries_exhausted: bool,
) -> NicClusterPolicyStatus {
    match report {
        PassReport::Unrecognized => NicClusterPolicyStatus {
            state: PolicyState::Ignore,
            detail: Some(format!("only the policy named {NIC_CLUSTER_POLICY_NAME} is processed")),
            applied_states: vec![],
        },
        // Nothing was applied, so what the last pass applied still stands.
        PassReport::Invalid(err) => NicClusterPolicyStatus {
            state: PolicyState::Error,
            detail: Some(err.to_string()),
            applied_states: previous.map(|s| s.applied_states.clone()).unwrap_or_default(),
        },
        PassReport::Failed(err) => {
            // A transient outage leaves the last known state alone until the budget runs out.
            let state = if !err.is_retryable() || retries_exhausted {
                PolicyState::Error
            } else {
                match previous.map(|s| s.state) {
                    None | Some(PolicyState::Ignore) => PolicyState::NotReady,
                    Some(state) => state,
                }
            };
            NicClusterPolicyStatus {
                state,
                detail: Some(err.to_string()),
                applied_states: previous.map(|s| s.applied_states.clone()).unwrap_or_default(),
            }
        }
        PassReport::Applied { desired, outcome } => applied_status(desired, outcome, retries_exhausted),
    }
}

fn applied_status(desired: &[DesiredResource], outcome: &ApplyOutcome, retries_exhausted: bool) -> NicClusterPolicyStatus {
    let mut applied_states: Vec<AppliedState> = Vec::new();
    for resource in desired {
        let name = resource.state_name();
        if applied_states.iter().any(|s| s.name == name) {
            continue;
        }
        let objects: Vec<&DesiredResource> = desired.iter().filter(|d| d.state_name() == name).collect();
        let failures: Vec<&ApplyFailure> = outcome
            .failures
            .iter()
            .filter(|f| f.state.as_deref() == Some(name))
            .collect();
        applied_states.push(component_state(name, &objects, &failures, outcome, retries_exhausted));
    }

    // Failures on objects no component wants any more, e.g. a delete that did not go through.
    let mut orphan_messages = Vec::new();
    let mut orphan_state = PolicyState::Ready;
    for failure in &outcome.failures {
        if failure
            .state
            .as_deref()
            .is_some_and(|state| applied_states.iter().any(|s| s.name == state))
        {
            continue;
        }
        orphan_state = orphan_state.max(failure_state(failure, retries_exhausted));
        orphan_messages.push(failure_message(failure));
    }

    let state = applied_states
        .iter()
        .map(|s| s.state)
        .chain(std::iter::once(orphan_state))
        .max()
        .unwrap_or(PolicyState::Ready);

    let messages: Vec<String> = applied_states
        .iter()
        .filter(|s| s.state != PolicyState::Ready)
        .filter_map(|s| s.message.as_ref().map(|m| format!("{}: {}", s.name, m)))
        .chain(orphan_messages)
        .collect();

    NicClusterPolicyStatus {
        state,
        detail: (state != PolicyState::Ready && !messages.is_empty()).then(|| messages.join("; ")),
        applied_states,
    }
}

fn component_state(
    name: &str,
    objects: &[&DesiredResource],
    failures: &[&ApplyFailure],
    outcome: &ApplyOutcome,
    retries_exhausted: bool,
) -> AppliedState {
    if !failures.is_empty() {
        let state = failures
            .iter()
            .map(|f| failure_state(f, retries_exhausted))
            .max()
            .unwrap_or(PolicyState::NotReady);
        let message = failures.iter().map(|f| failure_message(f)).collect::<Vec<_>>().join(", ");
        return AppliedState {
            name: name.to_string(),
            state,
            message: Some(message),
        };
    }

    let mut waiting = Vec::new();
    for resource in objects {
        let key = resource.object.key();
        match outcome.live.get(&key) {
            None => waiting.push(format!("{key} not found")),
            Some(ResourceObject::DaemonSet(ds)) => {
                if let Err(reason) = daemonset_readiness(ds) {
                    waiting.push(reason);
                } else if resource.component.is_driver() && scheduled_nowhere(ds) {
                    // No driver runs anywhere, so nothing is installed yet.
                    waiting.push(format!("DaemonSet {} is not scheduled on any node", ds.name_any()));
                }
            }
            Some(ResourceObject::ServiceAccount(_)) => {}
        }
    }

    if waiting.is_empty() {
        AppliedState {
            name: name.to_string(),
            state: PolicyState::Ready,
            message: None,
        }
    } else {
        AppliedState {
            name: name.to_string(),
            state: PolicyState::NotReady,
            message: Some(waiting.join(", ")),
        }
    }
}

fn failure_state(failure: &ApplyFailure, retries_exhausted: bool) -> PolicyState {
    if failure.error.is_retryable() && !retries_exhausted {
        PolicyState::NotReady
    } else {
        PolicyState::Error
    }
}

fn failure_message(failure: &ApplyFailure) -> String {
    format!("{:?} {} failed: {}", failure.action, failure.key, failure.error)
}

fn scheduled_nowhere(ds: &DaemonSet) -> bool {
    ds.status.as_ref().is_none_or(|status| status.desired_number_scheduled == 0)
}

/// Whether a DaemonSet has rolled out everywhere it is scheduled.
///
/// Requires the current generation to be observed, no unavailable pods, and
/// every scheduled pod available. A DaemonSet scheduled nowhere is ready.
pub fn daemonset_readiness(ds: &DaemonSet) -> Result<(), String> {
    let name = ds.name_any();
    let Some(status) = ds.status.as_ref() else {
        return Err(format!("DaemonSet {name} has no status yet"));
    };
    let generation = ds.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return Err(format!("DaemonSet {name} generation {generation} not observed yet"));
    }
    let unavailable = status.number_unavailable.unwrap_or(0);
    if unavailable > 0 {
        return Err(format!("DaemonSet {name} has {unavailable} unavailable pods"));
    }
    let available = status.number_available.unwrap_or(0);
    if available != status.desired_number_scheduled {
        return Err(format!(
            "DaemonSet {name} has {available} of {} pods available",
            status.desired_number_scheduled
        ));
    }
    Ok(())
}
