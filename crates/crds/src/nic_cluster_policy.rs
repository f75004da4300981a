//! NicClusterPolicy CRD
//!
//! Declares which network-acceleration components (NIC driver, device
//! plugins, secondary network CNI plugins) must run on the cluster.
//! Only the policy named [`NIC_CLUSTER_POLICY_NAME`] is acted upon.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The only policy name the controller processes.
pub const NIC_CLUSTER_POLICY_NAME: &str = "nic-cluster-policy";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "nicops.io",
    version = "v1alpha1",
    kind = "NicClusterPolicy",
    shortname = "ncp",
    status = "NicClusterPolicyStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NicClusterPolicySpec {
    /// NIC driver. The only driver-bearing component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ofed_driver: Option<DriverSpec>,

    /// RDMA shared device plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdma_shared_device_plugin: Option<ImageSpec>,

    /// SR-IOV network device plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sriov_device_plugin: Option<ImageSpec>,

    /// Secondary network CNI components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_network: Option<SecondaryNetworkSpec>,
}

/// Container image coordinates shared by every component.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub image: String,
    pub repository: String,
    /// Tag, or a `sha256:` digest
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

impl ImageSpec {
    /// Full image reference, `repo/image:tag` or `repo/image@sha256:...`.
    #[must_use]
    pub fn image_path(&self) -> String {
        if self.version.starts_with("sha256:") {
            format!("{}/{}@{}", self.repository, self.image, self.version)
        } else {
            format!("{}/{}:{}", self.repository, self.image, self.version)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpec {
    #[serde(flatten)]
    pub image_spec: ImageSpec,

    /// Extra environment passed to the driver container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryNetworkSpec {
    /// Standard container networking plugins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni_plugins: Option<ImageSpec>,

    /// Multus meta plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus: Option<ImageSpec>,

    /// IPAM plugin (whereabouts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam_plugin: Option<ImageSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NicClusterPolicyStatus {
    /// Aggregated state of the policy
    pub state: PolicyState,

    /// Human-readable explanation for the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Per component state, in render order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_states: Vec<AppliedState>,
}

impl NicClusterPolicyStatus {
    /// Returns the applied entry for a component state name, if any.
    #[must_use]
    pub fn applied(&self, name: &str) -> Option<&AppliedState> {
        self.applied_states.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedState {
    /// Component state name, e.g. `state-OFED`
    pub name: String,
    pub state: PolicyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Policy / component state.
///
/// Variants are declared from least to most severe among the states a
/// processed policy can take, so `Ord` picks the worst one. `Ignore` is only
/// used for unrecognized policies and never combined with the others.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub enum PolicyState {
    Ignore,
    Ready,
    #[default]
    NotReady,
    Error,
}

impl PolicyState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyState::Ignore => "Ignore",
            PolicyState::Ready => "Ready",
            PolicyState::NotReady => "NotReady",
            PolicyState::Error => "Error",
        }
    }
}

impl std::fmt::Display for PolicyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
