//! Cluster object store client
//!
//! Typed access to the objects the NIC policy controller reads and writes:
//! owned DaemonSets and ServiceAccounts, Node labels, and the policy status.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClient, KubeClusterClient, ResourceKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::new(kube::Client::try_default().await?);
//!
//! // Owned workloads in the operator namespace
//! let owned = client
//!     .list_owned(ResourceKind::DaemonSet, "nicops-system", "nicops.io/state")
//!     .await?;
//!
//! // Nodes and their labels
//! let nodes = client.list_nodes().await?;
//! # let _ = (owned, nodes);
//! # Ok(())
//! # }
//! ```
//!
//! The `test-util` feature adds [`MockClusterClient`], an in-memory store with
//! resource versions and fault injection.

pub mod client;
pub mod error;
pub mod objects;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::ClusterClient;
pub use error::ClusterError;
pub use objects::{ObjectKey, ResourceKind, ResourceObject};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockClusterClient, MockFailure, MockMutation, MockOperation};
