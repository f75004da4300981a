//! NicOps CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the NIC policy controller.

pub mod nic_cluster_policy;

pub use nic_cluster_policy::*;
