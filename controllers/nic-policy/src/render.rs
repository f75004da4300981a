//! State rendering.
//!
//! Turns a [`NicClusterPolicySpec`] into the DaemonSets and ServiceAccounts
//! that should exist, each tagged with the component state it belongs to.
//! Rendering is pure: the same spec and context always yield byte-identical
//! objects, so the spec hash stamped on each object only changes when the
//! policy does.

use crate::labels::{
    APP_LABEL, HAS_TARGET_NIC_LABEL, K8S_COMPONENT, K8S_MANAGED_BY, K8S_PART_OF, MANAGED_BY_NIC_POLICY,
    PART_OF_NICOPS, SPEC_HASH_ANNOTATION, STATE_LABEL,
};
use cluster_client::ResourceObject;
use crds::{ImageSpec, NicClusterPolicySpec};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, LocalObjectReference, PodSpec, PodTemplateSpec, SecurityContext,
    ServiceAccount, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// A component the policy can enable. Declaration order is render order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    OfedDriver,
    RdmaSharedDevicePlugin,
    SriovDevicePlugin,
    Multus,
    CniPlugins,
    IpamPlugin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Driver,
    DevicePlugin,
    Cni,
}

impl Component {
    /// State name, used as the state label value on owned objects
    #[must_use]
    pub fn state_name(self) -> &'static str {
        match self {
            Component::OfedDriver => "state-OFED",
            Component::RdmaSharedDevicePlugin => "state-RDMA-device-plugin",
            Component::SriovDevicePlugin => "state-SRIOV-device-plugin",
            Component::Multus => "state-multus-cni",
            Component::CniPlugins => "state-container-networking-plugins",
            Component::IpamPlugin => "state-whereabouts-cni",
        }
    }

    /// Name of the DaemonSet and ServiceAccount
    #[must_use]
    pub fn workload_name(self) -> &'static str {
        match self {
            Component::OfedDriver => "mofed",
            Component::RdmaSharedDevicePlugin => "rdma-shared-dp",
            Component::SriovDevicePlugin => "sriov-device-plugin",
            Component::Multus => "kube-multus",
            Component::CniPlugins => "cni-plugins",
            Component::IpamPlugin => "whereabouts",
        }
    }

    #[must_use]
    pub fn is_driver(self) -> bool {
        self.flavor() == Flavor::Driver
    }

    fn flavor(self) -> Flavor {
        match self {
            Component::OfedDriver => Flavor::Driver,
            Component::RdmaSharedDevicePlugin | Component::SriovDevicePlugin => Flavor::DevicePlugin,
            Component::Multus | Component::CniPlugins | Component::IpamPlugin => Flavor::Cni,
        }
    }
}

/// State name of the driver-bearing component
pub const DRIVER_STATE: &str = "state-OFED";

/// One object that should exist, and the component that wants it.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredResource {
    pub component: Component,
    pub object: ResourceObject,
}

impl DesiredResource {
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        self.component.state_name()
    }
}

/// Where rendered objects go and who owns them.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub namespace: String,
    pub owner: Option<OwnerReference>,
}

/// Structural problems in the policy spec. Retrying cannot fix these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("{state}: {field} must not be empty")]
    EmptyField { state: &'static str, field: &'static str },

    #[error("{state}: {field} {value:?} must not contain whitespace")]
    Whitespace {
        state: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("{state}: image pull secret {name:?} is not a valid object name")]
    InvalidPullSecret { state: &'static str, name: String },

    #[error("{state}: env var {name:?} is empty, contains '=' or is duplicated")]
    InvalidEnv { state: &'static str, name: String },

    #[error("{state}: failed to serialize rendered object: {message}")]
    Serialization { state: &'static str, message: String },
}

/// Components present in the spec, in render order, with their image.
#[must_use]
pub fn enabled_components(spec: &NicClusterPolicySpec) -> Vec<(Component, &ImageSpec)> {
    let network = spec.secondary_network.as_ref();
    let candidates = [
        (Component::OfedDriver, spec.ofed_driver.as_ref().map(|d| &d.image_spec)),
        (Component::RdmaSharedDevicePlugin, spec.rdma_shared_device_plugin.as_ref()),
        (Component::SriovDevicePlugin, spec.sriov_device_plugin.as_ref()),
        (Component::Multus, network.and_then(|n| n.multus.as_ref())),
        (Component::CniPlugins, network.and_then(|n| n.cni_plugins.as_ref())),
        (Component::IpamPlugin, network.and_then(|n| n.ipam_plugin.as_ref())),
    ];
    candidates
        .into_iter()
        .filter_map(|(component, image)| image.map(|image| (component, image)))
        .collect()
}

/// Renders every object the policy asks for.
///
/// Each enabled component yields its ServiceAccount followed by its DaemonSet.
/// An empty spec renders nothing.
pub fn render(spec: &NicClusterPolicySpec, ctx: &RenderContext) -> Result<Vec<DesiredResource>, RenderError> {
    let mut desired = Vec::new();
    for (component, image) in enabled_components(spec) {
        validate_image(component, image)?;
        let env = match (component, spec.ofed_driver.as_ref()) {
            (Component::OfedDriver, Some(driver)) => {
                validate_env(component, &driver.env)?;
                driver
                    .env
                    .iter()
                    .map(|var| EnvVar {
                        name: var.name.clone(),
                        value: Some(var.value.clone()),
                        ..Default::default()
                    })
                    .collect()
            }
            _ => Vec::new(),
        };

        let account = service_account(component, ctx);
        desired.push(DesiredResource {
            component,
            object: stamp(component, account)?,
        });
        let workload = daemon_set(component, image, env, ctx);
        desired.push(DesiredResource {
            component,
            object: stamp(component, workload)?,
        });
    }
    Ok(desired)
}

/// Digest of a rendered object, `sha256:` plus the first 16 bytes in hex.
fn spec_hash<T: Serialize>(component: Component, object: &T) -> Result<String, RenderError> {
    let bytes = serde_json::to_vec(object).map_err(|e| RenderError::Serialization {
        state: component.state_name(),
        message: e.to_string(),
    })?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("sha256:{}", hex::encode(&digest[..16])))
}

/// Hashes the object and records the hash as an annotation.
fn stamp<T>(component: Component, object: T) -> Result<ResourceObject, RenderError>
where
    T: Serialize + Into<ResourceObject>,
{
    let hash = spec_hash(component, &object)?;
    let mut object: ResourceObject = object.into();
    object
        .meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(SPEC_HASH_ANNOTATION.to_string(), hash);
    Ok(object)
}

fn validate_image(component: Component, image: &ImageSpec) -> Result<(), RenderError> {
    let state = component.state_name();
    for (field, value) in [
        ("image", &image.image),
        ("repository", &image.repository),
        ("version", &image.version),
    ] {
        if value.trim().is_empty() {
            return Err(RenderError::EmptyField { state, field });
        }
        if value.chars().any(char::is_whitespace) {
            return Err(RenderError::Whitespace {
                state,
                field,
                value: value.clone(),
            });
        }
    }
    if let Some(bad) = image.image_pull_secrets.iter().find(|s| !is_dns_subdomain(s)) {
        return Err(RenderError::InvalidPullSecret {
            state,
            name: bad.clone(),
        });
    }
    Ok(())
}

fn validate_env(component: Component, env: &[crds::EnvVar]) -> Result<(), RenderError> {
    let mut seen = BTreeSet::new();
    for var in env {
        if var.name.is_empty() || var.name.contains('=') || !seen.insert(var.name.as_str()) {
            return Err(RenderError::InvalidEnv {
                state: component.state_name(),
                name: var.name.clone(),
            });
        }
    }
    Ok(())
}

/// RFC 1123 subdomain, the rule for Secret names.
fn is_dns_subdomain(name: &str) -> bool {
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.';
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    !name.is_empty()
        && name.len() <= 253
        && name.chars().all(valid_char)
        && name.starts_with(alnum)
        && name.ends_with(alnum)
}

fn object_meta(component: Component, ctx: &RenderContext) -> ObjectMeta {
    ObjectMeta {
        name: Some(component.workload_name().to_string()),
        namespace: Some(ctx.namespace.clone()),
        labels: Some(BTreeMap::from([
            (STATE_LABEL.to_string(), component.state_name().to_string()),
            (K8S_MANAGED_BY.to_string(), MANAGED_BY_NIC_POLICY.to_string()),
            (K8S_PART_OF.to_string(), PART_OF_NICOPS.to_string()),
            (K8S_COMPONENT.to_string(), component.workload_name().to_string()),
        ])),
        owner_references: ctx.owner.clone().map(|owner| vec![owner]),
        ..Default::default()
    }
}

fn service_account(component: Component, ctx: &RenderContext) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(component, ctx),
        ..Default::default()
    }
}

fn host_path(name: &str, path: &str, mount_path: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: path.to_string(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        },
        VolumeMount {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        },
    )
}

fn host_mounts(component: Component) -> Vec<(Volume, VolumeMount)> {
    match component.flavor() {
        Flavor::Driver => vec![host_path("run-mellanox-drivers", "/run/mellanox/drivers", "/run/mellanox/drivers")],
        Flavor::DevicePlugin => vec![host_path(
            "device-plugin",
            "/var/lib/kubelet/device-plugins",
            "/var/lib/kubelet/device-plugins",
        )],
        Flavor::Cni => vec![
            host_path("cni-bin", "/opt/cni/bin", "/host/opt/cni/bin"),
            host_path("cni-conf", "/etc/cni/net.d", "/host/etc/cni/net.d"),
        ],
    }
}

fn daemon_set(component: Component, image: &ImageSpec, env: Vec<EnvVar>, ctx: &RenderContext) -> DaemonSet {
    let name = component.workload_name();
    let flavor = component.flavor();
    let selector = BTreeMap::from([(APP_LABEL.to_string(), name.to_string())]);
    let mut pod_labels = selector.clone();
    pod_labels.insert(STATE_LABEL.to_string(), component.state_name().to_string());

    let (volumes, mounts): (Vec<_>, Vec<_>) = host_mounts(component).into_iter().unzip();
    let privileged = matches!(flavor, Flavor::Driver | Flavor::DevicePlugin);

    let container = Container {
        name: name.to_string(),
        image: Some(image.image_path()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: (!env.is_empty()).then_some(env),
        security_context: Some(SecurityContext {
            privileged: Some(privileged),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let pod = PodSpec {
        service_account_name: Some(name.to_string()),
        containers: vec![container],
        host_network: Some(flavor == Flavor::Cni),
        // The driver only lands on nodes already marked as carrying a target NIC.
        node_selector: component
            .is_driver()
            .then(|| BTreeMap::from([(HAS_TARGET_NIC_LABEL.to_string(), "true".to_string())])),
        tolerations: Some(vec![Toleration {
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]),
        image_pull_secrets: (!image.image_pull_secrets.is_empty()).then(|| {
            image
                .image_pull_secrets
                .iter()
                .map(|secret| LocalObjectReference { name: secret.clone() })
                .collect()
        }),
        priority_class_name: Some("system-node-critical".to_string()),
        volumes: Some(volumes),
        ..Default::default()
    };

    // A driver pod must never be replaced underneath a running node.
    let update_strategy = component.is_driver().then(|| DaemonSetUpdateStrategy {
        type_: Some("OnDelete".to_string()),
        rolling_update: None,
    });

    DaemonSet {
        metadata: object_meta(component, ctx),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            update_strategy,
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{driver_spec, full_spec, image};
    use cluster_client::ResourceKind;
    use crds::SecondaryNetworkSpec;

    fn ctx() -> RenderContext {
        RenderContext {
            namespace: "nicops-system".to_string(),
            owner: None,
        }
    }

    fn whereabouts_spec() -> NicClusterPolicySpec {
        NicClusterPolicySpec {
            secondary_network: Some(SecondaryNetworkSpec {
                ipam_plugin: Some(image("whereabouts", "ghcr.io/k8snetworkplumbingwg", "v0.6.1")),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn daemonset_of(desired: &[DesiredResource], component: Component) -> DaemonSet {
        desired
            .iter()
            .find_map(|d| match &d.object {
                ResourceObject::DaemonSet(ds) if d.component == component => Some(ds.as_ref().clone()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_empty_spec_renders_nothing() {
        let desired = render(&NicClusterPolicySpec::default(), &ctx()).unwrap();
        assert!(desired.is_empty());
    }

    #[test]
    fn test_ipam_plugin_renders_account_and_daemonset() {
        let desired = render(&whereabouts_spec(), &ctx()).unwrap();
        let keys: Vec<_> = desired.iter().map(|d| d.object.key()).collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].kind, ResourceKind::ServiceAccount);
        assert_eq!(keys[1].kind, ResourceKind::DaemonSet);
        for d in &desired {
            assert_eq!(d.object.name(), "whereabouts");
            assert_eq!(d.object.namespace(), Some("nicops-system"));
            assert_eq!(d.object.label(STATE_LABEL), Some("state-whereabouts-cni"));
            assert_eq!(d.object.label(K8S_MANAGED_BY), Some(MANAGED_BY_NIC_POLICY));
            assert!(d.object.annotation(SPEC_HASH_ANNOTATION).unwrap().starts_with("sha256:"));
        }

        let ds = daemonset_of(&desired, Component::IpamPlugin);
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("ghcr.io/k8snetworkplumbingwg/whereabouts:v0.6.1")
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let mut spec = whereabouts_spec();
        spec.ofed_driver = Some(driver_spec());
        let first = render(&spec, &ctx()).unwrap();
        let second = render(&spec, &ctx()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_hash_changes_with_image_version() {
        let before = render(&whereabouts_spec(), &ctx()).unwrap();
        let mut spec = whereabouts_spec();
        if let Some(ipam) = spec.secondary_network.as_mut().and_then(|n| n.ipam_plugin.as_mut()) {
            ipam.version = "v0.7.0".to_string();
        }
        let after = render(&spec, &ctx()).unwrap();

        let hash = |d: &[DesiredResource]| d[1].object.annotation(SPEC_HASH_ANNOTATION).map(str::to_string);
        assert_ne!(hash(&before), hash(&after));
        // The ServiceAccount does not depend on the image
        assert_eq!(
            before[0].object.annotation(SPEC_HASH_ANNOTATION),
            after[0].object.annotation(SPEC_HASH_ANNOTATION)
        );
    }

    #[test]
    fn test_driver_targets_nic_nodes_with_on_delete() {
        let spec = NicClusterPolicySpec {
            ofed_driver: Some(driver_spec()),
            ..Default::default()
        };
        let desired = render(&spec, &ctx()).unwrap();
        assert!(desired.iter().all(|d| d.state_name() == DRIVER_STATE));

        let ds = daemonset_of(&desired, Component::OfedDriver);
        assert_eq!(ds.metadata.name.as_deref(), Some("mofed"));
        let ds_spec = ds.spec.unwrap();
        assert_eq!(
            ds_spec.update_strategy.and_then(|s| s.type_).as_deref(),
            Some("OnDelete")
        );
        let pod = ds_spec.template.spec.unwrap();
        assert_eq!(
            pod.node_selector.unwrap().get(HAS_TARGET_NIC_LABEL).map(String::as_str),
            Some("true")
        );
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("nvcr.io/nvidia/mellanox/mofed:5.9-0.5.6.0")
        );
        assert_eq!(container.security_context.as_ref().and_then(|s| s.privileged), Some(true));
        assert_eq!(container.env.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_render_order_follows_components() {
        let mut spec = whereabouts_spec();
        spec.ofed_driver = Some(driver_spec());
        spec.rdma_shared_device_plugin = Some(image("k8s-rdma-shared-dev-plugin", "ghcr.io/mellanox", "v1.4.0"));
        let states: Vec<_> = render(&spec, &ctx())
            .unwrap()
            .iter()
            .map(DesiredResource::state_name)
            .collect();
        assert_eq!(
            states,
            vec![
                "state-OFED",
                "state-OFED",
                "state-RDMA-device-plugin",
                "state-RDMA-device-plugin",
                "state-whereabouts-cni",
                "state-whereabouts-cni",
            ]
        );
    }

    #[test]
    fn test_owner_reference_is_attached() {
        let ctx = RenderContext {
            namespace: "nicops-system".to_string(),
            owner: Some(OwnerReference {
                api_version: "nicops.io/v1alpha1".to_string(),
                kind: "NicClusterPolicy".to_string(),
                name: "nic-cluster-policy".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                ..Default::default()
            }),
        };
        let desired = render(&whereabouts_spec(), &ctx).unwrap();
        for d in desired {
            let owners = d.object.meta().owner_references.clone().unwrap();
            assert_eq!(owners[0].uid, "uid-1");
        }
    }

    #[test]
    fn test_empty_version_is_rejected() {
        let mut spec = whereabouts_spec();
        if let Some(ipam) = spec.secondary_network.as_mut().and_then(|n| n.ipam_plugin.as_mut()) {
            ipam.version = String::new();
        }
        let err = render(&spec, &ctx()).unwrap_err();
        assert_eq!(
            err,
            RenderError::EmptyField {
                state: "state-whereabouts-cni",
                field: "version"
            }
        );
    }

    #[test]
    fn test_whitespace_in_repository_is_rejected() {
        let mut spec = whereabouts_spec();
        if let Some(ipam) = spec.secondary_network.as_mut().and_then(|n| n.ipam_plugin.as_mut()) {
            ipam.repository = "ghcr.io/ k8s".to_string();
        }
        assert!(matches!(
            render(&spec, &ctx()),
            Err(RenderError::Whitespace { field: "repository", .. })
        ));
    }

    #[test]
    fn test_invalid_pull_secret_is_rejected() {
        let mut spec = whereabouts_spec();
        if let Some(ipam) = spec.secondary_network.as_mut().and_then(|n| n.ipam_plugin.as_mut()) {
            ipam.image_pull_secrets = vec!["Not_Valid".to_string()];
        }
        assert!(matches!(
            render(&spec, &ctx()),
            Err(RenderError::InvalidPullSecret { .. })
        ));
    }

    #[test]
    fn test_duplicate_driver_env_is_rejected() {
        let mut driver = driver_spec();
        driver.env.push(driver.env[0].clone());
        let spec = NicClusterPolicySpec {
            ofed_driver: Some(driver),
            ..Default::default()
        };
        assert!(matches!(render(&spec, &ctx()), Err(RenderError::InvalidEnv { .. })));
    }

    #[test]
    fn test_state_names_are_unique() {
        let spec = full_spec();
        let components = enabled_components(&spec);
        assert_eq!(components.len(), 6);
        let names: BTreeSet<_> = components.iter().map(|(c, _)| c.state_name()).collect();
        let workloads: BTreeSet<_> = components.iter().map(|(c, _)| c.workload_name()).collect();
        assert_eq!(names.len(), 6);
        assert_eq!(workloads.len(), 6);
        assert_eq!(Component::OfedDriver.state_name(), DRIVER_STATE);
    }

    #[test]
    fn test_dns_subdomain() {
        assert!(is_dns_subdomain("regcred"));
        assert!(is_dns_subdomain("my.registry-cred1"));
        assert!(!is_dns_subdomain(""));
        assert!(!is_dns_subdomain("-leading"));
        assert!(!is_dns_subdomain("UPPER"));
    }
}
