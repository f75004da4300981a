//! Owned sub-resource model
//!
//! The controller owns a closed set of object kinds. [`ResourceObject`] wraps
//! each of them so that listing, diffing and applying can be written once.

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::fmt;

/// Kinds of sub-resources the controller manages.
///
/// Declaration order is the apply order for creates: identities before the
/// workloads that reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ServiceAccount,
    DaemonSet,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::ServiceAccount, ResourceKind::DaemonSet];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::ServiceAccount => f.write_str("ServiceAccount"),
            ResourceKind::DaemonSet => f.write_str("DaemonSet"),
        }
    }
}

/// Identity of an owned object inside the operator namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A typed sub-resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceObject {
    ServiceAccount(ServiceAccount),
    DaemonSet(Box<DaemonSet>),
}

impl ResourceObject {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceObject::ServiceAccount(_) => ResourceKind::ServiceAccount,
            ResourceObject::DaemonSet(_) => ResourceKind::DaemonSet,
        }
    }

    #[must_use]
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ResourceObject::ServiceAccount(sa) => &sa.metadata,
            ResourceObject::DaemonSet(ds) => &ds.metadata,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ResourceObject::ServiceAccount(sa) => &mut sa.metadata,
            ResourceObject::DaemonSet(ds) => &mut ds.metadata,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: self.kind(),
            name: self.name().to_string(),
        }
    }

    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta().labels.as_ref()?.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta().annotations.as_ref()?.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn set_resource_version(&mut self, version: Option<String>) {
        self.meta_mut().resource_version = version;
    }
}

impl From<ServiceAccount> for ResourceObject {
    fn from(sa: ServiceAccount) -> Self {
        ResourceObject::ServiceAccount(sa)
    }
}

impl From<DaemonSet> for ResourceObject {
    fn from(ds: DaemonSet) -> Self {
        ResourceObject::DaemonSet(Box::new(ds))
    }
}
