//! Pass-level tests for the policy reconciler

use super::*;
use crate::labels::{HAS_TARGET_NIC_LABEL, STATE_LABEL, WAIT_FOR_DRIVER_LABEL};
use crate::test_utils::{
    NIC_DISCOVERY, TEST_NAMESPACE, daemonset_status, driver_spec, full_spec, ipam_spec, node, policy, reconciler,
    test_config,
};
use cluster_client::{MockClusterClient, MockFailure, MockMutation, MockOperation, ResourceKind};
use crds::NicClusterPolicySpec;
use std::time::Duration;

fn driver_only() -> NicClusterPolicySpec {
    NicClusterPolicySpec {
        ofed_driver: Some(driver_spec()),
        ..Default::default()
    }
}

fn state_of(mock: &MockClusterClient) -> PolicyState {
    mock.policy_status(NIC_CLUSTER_POLICY_NAME).unwrap().state
}

#[tokio::test]
async fn test_unsupported_name_is_ignored() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    let reconciler = reconciler(&mock, test_config());

    let action = reconciler
        .reconcile_policy(&policy("my-policy", full_spec()))
        .await
        .unwrap();

    assert_eq!(action, Action::await_change());
    assert_eq!(mock.policy_status("my-policy").unwrap().state, PolicyState::Ignore);
    assert!(mock.objects(TEST_NAMESPACE).is_empty());
    assert_eq!(mock.mutations(), vec![MockMutation::PatchStatus("my-policy".to_string())]);
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL), None);
}

#[tokio::test]
async fn test_unsupported_names_leave_no_tracking_behind() {
    let mock = MockClusterClient::new();
    mock.fail(MockOperation::PatchStatus, None, 1, MockFailure::Unavailable);
    let config = test_config();
    let reconciler = reconciler(&mock, config.clone());
    let ignored = policy("my-policy", ipam_spec());

    let err = reconciler.reconcile_policy(&ignored).await.unwrap_err();
    let action = reconciler.error_action("my-policy", &err);
    assert_eq!(action, Action::requeue(Duration::from_secs(config.backoff_max_seconds)));
    reconciler.reconcile_policy(&ignored).await.unwrap();
    assert_eq!(mock.policy_status("my-policy").unwrap().state, PolicyState::Ignore);

    assert_eq!(reconciler.backoff.tracked(), 0);
    assert!(reconciler.status_cache.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_component_lifecycle() {
    let mock = MockClusterClient::new();
    let config = test_config();
    let reconciler = reconciler(&mock, config.clone());

    // Added: the pair is created and the policy waits for the rollout.
    let action = reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, ipam_spec()))
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(config.not_ready_requeue));
    assert_eq!(state_of(&mock), PolicyState::NotReady);
    let objects = mock.objects(TEST_NAMESPACE);
    assert_eq!(objects.len(), 2);
    assert!(
        objects
            .iter()
            .all(|o| o.label(STATE_LABEL) == Some("state-whereabouts-cni"))
    );

    // Rolled out everywhere.
    mock.set_daemonset_status(TEST_NAMESPACE, "whereabouts", daemonset_status(3, 3));
    let action = reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, ipam_spec()))
        .await
        .unwrap();
    assert_eq!(action, Action::await_change());
    let status = mock.policy_status(NIC_CLUSTER_POLICY_NAME).unwrap();
    assert_eq!(status.state, PolicyState::Ready);
    assert_eq!(status.detail, None);

    // Removed: the pair goes away.
    let action = reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, NicClusterPolicySpec::default()))
        .await
        .unwrap();
    assert_eq!(action, Action::await_change());
    assert!(mock.objects(TEST_NAMESPACE).is_empty());
    assert_eq!(state_of(&mock), PolicyState::Ready);
}

#[tokio::test]
async fn test_second_pass_makes_no_writes() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    mock.add_node(node("worker-2", &[]));
    let reconciler = reconciler(&mock, test_config());
    let policy = policy(NIC_CLUSTER_POLICY_NAME, full_spec());

    reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(mock.objects(TEST_NAMESPACE).len(), 12);

    mock.clear_mutations();
    reconciler.reconcile_policy(&policy).await.unwrap();
    assert!(mock.mutations().is_empty());
}

#[tokio::test]
async fn test_status_already_on_object_is_not_rewritten() {
    let mock = MockClusterClient::new();
    let first = reconciler(&mock, test_config());
    let mut policy = policy(NIC_CLUSTER_POLICY_NAME, NicClusterPolicySpec::default());
    first.reconcile_policy(&policy).await.unwrap();
    policy.status = mock.policy_status(NIC_CLUSTER_POLICY_NAME);

    // A restarted controller has no cache but sees the status on the object.
    mock.clear_mutations();
    let restarted = reconciler(&mock, test_config());
    restarted.reconcile_policy(&policy).await.unwrap();
    assert!(mock.mutations().is_empty());
}

#[tokio::test]
async fn test_driver_gates_nodes_until_policy_deleted() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    mock.add_node(node("worker-2", &[]));
    let reconciler = reconciler(&mock, test_config());
    let policy = policy(NIC_CLUSTER_POLICY_NAME, driver_only());

    reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("true"));
    assert_eq!(mock.node_label("worker-1", HAS_TARGET_NIC_LABEL).as_deref(), Some("true"));
    assert_eq!(mock.node_label("worker-2", WAIT_FOR_DRIVER_LABEL), None);

    // Still pending while the policy exists.
    reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("true"));

    let action = reconciler.cleanup_policy(&policy).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("false"));
    assert_eq!(mock.node_label("worker-1", HAS_TARGET_NIC_LABEL).as_deref(), Some("true"));
}

#[tokio::test]
async fn test_driver_removal_releases_nodes() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    let reconciler = reconciler(&mock, test_config());

    reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, driver_only()))
        .await
        .unwrap();
    reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, NicClusterPolicySpec::default()))
        .await
        .unwrap();

    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("false"));
    assert!(mock.object(ResourceKind::DaemonSet, TEST_NAMESPACE, "mofed").is_none());
}

#[tokio::test]
async fn test_completed_install_is_not_gated_again() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    let reconciler = reconciler(&mock, test_config());
    let policy = policy(NIC_CLUSTER_POLICY_NAME, driver_only());
    reconciler.reconcile_policy(&policy).await.unwrap();

    // The driver pod clears the flag once loaded.
    mock.set_node_label("worker-1", WAIT_FOR_DRIVER_LABEL, "false");
    reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("false"));

    // A node that shows up later is still gated.
    mock.add_node(node("worker-3", &[(NIC_DISCOVERY, "true")]));
    reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(mock.node_label("worker-3", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("true"));
}

#[tokio::test]
async fn test_invalid_spec_in_between_does_not_gate_finished_nodes() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    let reconciler = reconciler(&mock, test_config());
    let spec = NicClusterPolicySpec {
        ofed_driver: Some(driver_spec()),
        ..ipam_spec()
    };
    reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, spec.clone()))
        .await
        .unwrap();
    mock.set_node_label("worker-1", WAIT_FOR_DRIVER_LABEL, "false");
    reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, spec.clone()))
        .await
        .unwrap();

    // A typo in an unrelated component, then the fix.
    let mut broken = spec.clone();
    if let Some(ipam) = broken.secondary_network.as_mut().and_then(|n| n.ipam_plugin.as_mut()) {
        ipam.version = String::new();
    }
    reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, broken))
        .await
        .unwrap();
    let status = mock.policy_status(NIC_CLUSTER_POLICY_NAME).unwrap();
    assert_eq!(status.state, PolicyState::Error);
    assert!(status.applied(DRIVER_STATE).is_some());

    reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, spec))
        .await
        .unwrap();
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("false"));
}

#[tokio::test]
async fn test_existing_driver_is_not_fresh_without_a_status() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    let first = reconciler(&mock, test_config());
    first
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, driver_only()))
        .await
        .unwrap();
    mock.set_node_label("worker-1", WAIT_FOR_DRIVER_LABEL, "false");

    // The status write was lost and the controller restarted: only the DaemonSet remains.
    let restarted = reconciler(&mock, test_config());
    restarted
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, driver_only()))
        .await
        .unwrap();
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("false"));
}

#[tokio::test]
async fn test_partial_failure_requeues_with_backoff() {
    let mock = MockClusterClient::new();
    mock.fail(MockOperation::Create, Some("mofed"), 2, MockFailure::Unavailable);
    let config = test_config();
    let reconciler = reconciler(&mock, config.clone());
    let policy = policy(NIC_CLUSTER_POLICY_NAME, full_spec());

    let action = reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(config.backoff_min_seconds)));
    assert_eq!(mock.objects(TEST_NAMESPACE).len(), 10);
    let status = mock.policy_status(NIC_CLUSTER_POLICY_NAME).unwrap();
    assert_eq!(status.state, PolicyState::NotReady);
    assert!(status.detail.unwrap().contains("state-OFED"));

    // The next pass picks the failed pair up.
    let action = reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(action, Action::requeue(config.not_ready_requeue));
    assert_eq!(mock.objects(TEST_NAMESPACE).len(), 12);
}

#[tokio::test]
async fn test_exhausted_retries_report_error() {
    let mock = MockClusterClient::new();
    mock.fail(MockOperation::List, None, 10, MockFailure::Unavailable);
    let config = Config {
        max_transient_retries: 2,
        ..test_config()
    };
    let reconciler = reconciler(&mock, config);
    let policy = policy(NIC_CLUSTER_POLICY_NAME, ipam_spec());

    let mut delays = Vec::new();
    for _ in 0..2 {
        delays.push(reconciler.reconcile_policy(&policy).await.unwrap());
        assert_eq!(state_of(&mock), PolicyState::NotReady);
    }
    delays.push(reconciler.reconcile_policy(&policy).await.unwrap());
    assert_eq!(state_of(&mock), PolicyState::Error);
    assert_eq!(
        delays,
        vec![
            Action::requeue(Duration::from_secs(1)),
            Action::requeue(Duration::from_secs(1)),
            Action::requeue(Duration::from_secs(2)),
        ]
    );
}

#[tokio::test]
async fn test_transient_outage_keeps_ready_status() {
    let mock = MockClusterClient::new();
    let reconciler = reconciler(&mock, test_config());
    let policy = policy(NIC_CLUSTER_POLICY_NAME, ipam_spec());
    reconciler.reconcile_policy(&policy).await.unwrap();
    mock.set_daemonset_status(TEST_NAMESPACE, "whereabouts", daemonset_status(1, 1));
    reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(state_of(&mock), PolicyState::Ready);

    mock.fail(MockOperation::List, None, 1, MockFailure::Unavailable);
    let action = reconciler.reconcile_policy(&policy).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    let status = mock.policy_status(NIC_CLUSTER_POLICY_NAME).unwrap();
    assert_eq!(status.state, PolicyState::Ready);
    assert!(status.detail.is_some());
    assert_eq!(status.applied_states.len(), 1);
}

#[tokio::test]
async fn test_invalid_spec_reports_error_without_writes() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    let reconciler = reconciler(&mock, test_config());
    let mut spec = driver_only();
    if let Some(driver) = spec.ofed_driver.as_mut() {
        driver.image_spec.version = String::new();
    }

    let action = reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, spec))
        .await
        .unwrap();
    assert_eq!(action, Action::await_change());
    let status = mock.policy_status(NIC_CLUSTER_POLICY_NAME).unwrap();
    assert_eq!(status.state, PolicyState::Error);
    assert!(status.detail.unwrap().contains("version"));
    assert!(mock.objects(TEST_NAMESPACE).is_empty());
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL), None);
}

#[tokio::test]
async fn test_node_conflict_is_retried_within_the_pass() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(NIC_DISCOVERY, "true")]));
    mock.fail(MockOperation::PatchNode, Some("worker-1"), 1, MockFailure::Conflict);
    let config = test_config();
    let reconciler = reconciler(&mock, config.clone());

    let action = reconciler
        .reconcile_policy(&policy(NIC_CLUSTER_POLICY_NAME, driver_only()))
        .await
        .unwrap();
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("true"));
    // Not a transient failure: the pass only waits for the rollout.
    assert_eq!(action, Action::requeue(config.not_ready_requeue));
}

#[tokio::test]
async fn test_cleanup_keeps_failing_until_nodes_are_released() {
    let mock = MockClusterClient::new();
    mock.add_node(node("worker-1", &[(WAIT_FOR_DRIVER_LABEL, "true")]));
    mock.fail(MockOperation::PatchNode, Some("worker-1"), 10, MockFailure::Conflict);
    let reconciler = reconciler(&mock, test_config());
    let policy = policy(NIC_CLUSTER_POLICY_NAME, driver_only());

    let err = reconciler.cleanup_policy(&policy).await.unwrap_err();
    assert!(matches!(err, ControllerError::NodeLabelCleanup(_)));
    assert!(err.is_retryable());
    assert_eq!(mock.node_label("worker-1", WAIT_FOR_DRIVER_LABEL).as_deref(), Some("true"));
}

#[tokio::test]
async fn test_error_action_backs_off() {
    let mock = MockClusterClient::new();
    let reconciler = reconciler(&mock, test_config());
    let err = ControllerError::Watch("stream ended".to_string());

    let delays: Vec<Action> = (0..4)
        .map(|_| reconciler.error_action(NIC_CLUSTER_POLICY_NAME, &err))
        .collect();
    assert_eq!(
        delays,
        [1, 1, 2, 3]
            .into_iter()
            .map(|s| Action::requeue(Duration::from_secs(s)))
            .collect::<Vec<_>>()
    );
}
