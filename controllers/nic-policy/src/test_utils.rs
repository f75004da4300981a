//! Test utilities for unit testing the reconciler
//!
//! Builders for policies, nodes and DaemonSet statuses, plus a reconciler
//! wired to a [`MockClusterClient`].

use crate::config::Config;
use crate::reconciler::Reconciler;
use cluster_client::MockClusterClient;
use crds::{DriverSpec, EnvVar, ImageSpec, NicClusterPolicy, NicClusterPolicySpec, SecondaryNetworkSpec};
use k8s_openapi::api::apps::v1::DaemonSetStatus;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

pub const TEST_NAMESPACE: &str = "nicops-system";
pub const NIC_DISCOVERY: &str = "feature.node.kubernetes.io/pci-15b3.present";

/// Helper to create an image spec
pub fn image(name: &str, repository: &str, version: &str) -> ImageSpec {
    ImageSpec {
        image: name.to_string(),
        repository: repository.to_string(),
        version: version.to_string(),
        image_pull_secrets: vec![],
    }
}

/// Helper to create the driver spec used across tests
pub fn driver_spec() -> DriverSpec {
    DriverSpec {
        image_spec: image("mofed", "nvcr.io/nvidia/mellanox", "5.9-0.5.6.0"),
        env: vec![EnvVar {
            name: "UNLOAD_STORAGE_MODULES".to_string(),
            value: "true".to_string(),
        }],
    }
}

/// Spec with only the whereabouts IPAM plugin
pub fn ipam_spec() -> NicClusterPolicySpec {
    NicClusterPolicySpec {
        secondary_network: Some(SecondaryNetworkSpec {
            ipam_plugin: Some(image("whereabouts", "ghcr.io/k8snetworkplumbingwg", "v0.6.1")),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Spec with every component enabled
pub fn full_spec() -> NicClusterPolicySpec {
    NicClusterPolicySpec {
        ofed_driver: Some(driver_spec()),
        rdma_shared_device_plugin: Some(image("k8s-rdma-shared-dev-plugin", "ghcr.io/mellanox", "v1.4.0")),
        sriov_device_plugin: Some(image("sriov-network-device-plugin", "ghcr.io/k8snetworkplumbingwg", "v3.6.2")),
        secondary_network: Some(SecondaryNetworkSpec {
            cni_plugins: Some(image("plugins", "ghcr.io/k8snetworkplumbingwg", "v1.3.0")),
            multus: Some(image("multus-cni", "ghcr.io/k8snetworkplumbingwg", "v4.0.2")),
            ipam_plugin: Some(image("whereabouts", "ghcr.io/k8snetworkplumbingwg", "v0.6.1")),
        }),
    }
}

/// Helper to create a NicClusterPolicy with a uid, so owner references render
pub fn policy(name: &str, spec: NicClusterPolicySpec) -> NicClusterPolicy {
    let mut policy = NicClusterPolicy::new(name, spec);
    policy.metadata.uid = Some(format!("uid-{name}"));
    policy
}

/// Helper to create a Node with the given labels
pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// DaemonSet status with `available` of `desired` pods up
pub fn daemonset_status(desired: i32, available: i32) -> DaemonSetStatus {
    DaemonSetStatus {
        desired_number_scheduled: desired,
        current_number_scheduled: desired,
        number_ready: available,
        number_available: Some(available),
        number_unavailable: Some(desired - available),
        updated_number_scheduled: Some(desired),
        ..Default::default()
    }
}

pub fn test_config() -> Config {
    Config {
        namespace: TEST_NAMESPACE.to_string(),
        nic_discovery_label: NIC_DISCOVERY.to_string(),
        ..Config::default()
    }
}

/// Reconciler backed by the given mock; the mock keeps shared state with its clones
pub fn reconciler(mock: &MockClusterClient, config: Config) -> Reconciler {
    Reconciler::new(Box::new(mock.clone()), config)
}
