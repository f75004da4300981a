//! Label, annotation and finalizer names used across the controller.

// ============================================================================
// Kubernetes Standard Labels
// ============================================================================

/// Standard label for the tool managing a resource
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard label for the component name
pub const K8S_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard label for the higher-level application a resource is part of
pub const K8S_PART_OF: &str = "app.kubernetes.io/part-of";

/// Value of `app.kubernetes.io/managed-by` on every owned object
pub const MANAGED_BY_NIC_POLICY: &str = "nic-policy-controller";

/// Value of `app.kubernetes.io/part-of` on every owned object
pub const PART_OF_NICOPS: &str = "nicops";

// ============================================================================
// Owned Sub-resource Labels
// ============================================================================

/// Component state an owned object belongs to, e.g. `state-OFED`
pub const STATE_LABEL: &str = "nicops.io/state";

/// Pod selector label of owned DaemonSets
pub const APP_LABEL: &str = "app";

/// Digest of the rendered object, compared to detect drift
pub const SPEC_HASH_ANNOTATION: &str = "nicops.io/spec-hash";

/// Label selector for listing owned objects
pub fn owned_selector() -> String {
    format!("{STATE_LABEL},{K8S_MANAGED_BY}={MANAGED_BY_NIC_POLICY}")
}

// ============================================================================
// Node Labels
// ============================================================================

/// Set to `true` while a driver installation is in flight on the node
pub const WAIT_FOR_DRIVER_LABEL: &str = "nicops.io/driver.wait";

/// Set to `true` when the node is a candidate for driver installation
pub const HAS_TARGET_NIC_LABEL: &str = "nicops.io/nic.present";

/// Default hardware discovery label (Mellanox PCI vendor present)
pub const DEFAULT_NIC_DISCOVERY_LABEL: &str = "feature.node.kubernetes.io/pci-15b3.present";

// ============================================================================
// Finalizers
// ============================================================================

/// Keeps the policy around until node labels have been unwound
pub const NODE_LABEL_CLEANUP_FINALIZER: &str = "nicops.io/node-label-cleanup";
