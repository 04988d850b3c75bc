//! Domain Ports - Core trait definitions for the NPU operator
//!
//! These traits define the boundaries between reconciliation logic and the
//! Kubernetes API. The controllers run against a kube-backed store; tests
//! run the same logic against an in-memory one.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::crd::{Condition, RBLNClusterPolicy, RBLNClusterPolicyStatus, RBLNDriver, RBLNDriverStatus};
use crate::error::Result;

// =============================================================================
// Object Identity
// =============================================================================

/// Kinds of objects the operator creates on behalf of its custom resources
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ServiceAccount,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    DaemonSet,
    Service,
    /// Schema-fluid objects addressed by apiVersion and kind
    Dynamic { api_version: String, kind: String },
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::ServiceAccount => write!(f, "ServiceAccount"),
            ObjectKind::Role => write!(f, "Role"),
            ObjectKind::RoleBinding => write!(f, "RoleBinding"),
            ObjectKind::ClusterRole => write!(f, "ClusterRole"),
            ObjectKind::ClusterRoleBinding => write!(f, "ClusterRoleBinding"),
            ObjectKind::ConfigMap => write!(f, "ConfigMap"),
            ObjectKind::DaemonSet => write!(f, "DaemonSet"),
            ObjectKind::Service => write!(f, "Service"),
            ObjectKind::Dynamic { api_version, kind } => write!(f, "{}/{}", api_version, kind),
        }
    }
}

/// Reference to one object; `namespace` is `None` for cluster-scoped kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn namespaced(kind: ObjectKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
        }
    }

    pub fn dynamic(api_version: &str, kind: &str, name: impl Into<String>) -> Self {
        Self::cluster(
            ObjectKind::Dynamic {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            },
            name,
        )
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

// =============================================================================
// Managed Objects
// =============================================================================

/// A fully rendered desired object
#[derive(Debug, Clone)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    DaemonSet(DaemonSet),
    Service(Service),
    Dynamic(DynamicObject),
}

impl ManagedObject {
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ManagedObject::ServiceAccount(o) => &o.metadata,
            ManagedObject::Role(o) => &o.metadata,
            ManagedObject::RoleBinding(o) => &o.metadata,
            ManagedObject::ClusterRole(o) => &o.metadata,
            ManagedObject::ClusterRoleBinding(o) => &o.metadata,
            ManagedObject::ConfigMap(o) => &o.metadata,
            ManagedObject::DaemonSet(o) => &o.metadata,
            ManagedObject::Service(o) => &o.metadata,
            ManagedObject::Dynamic(o) => &o.metadata,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::ServiceAccount(_) => ObjectKind::ServiceAccount,
            ManagedObject::Role(_) => ObjectKind::Role,
            ManagedObject::RoleBinding(_) => ObjectKind::RoleBinding,
            ManagedObject::ClusterRole(_) => ObjectKind::ClusterRole,
            ManagedObject::ClusterRoleBinding(_) => ObjectKind::ClusterRoleBinding,
            ManagedObject::ConfigMap(_) => ObjectKind::ConfigMap,
            ManagedObject::DaemonSet(_) => ObjectKind::DaemonSet,
            ManagedObject::Service(_) => ObjectKind::Service,
            ManagedObject::Dynamic(o) => {
                let types = o.types.clone().unwrap_or_default();
                ObjectKind::Dynamic {
                    api_version: types.api_version,
                    kind: types.kind,
                }
            }
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        let meta = self.metadata();
        ObjectRef {
            kind: self.kind(),
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
        }
    }
}

/// Result of a create-or-patch call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchOutcome::Created => write!(f, "created"),
            PatchOutcome::Updated => write!(f, "updated"),
            PatchOutcome::Unchanged => write!(f, "unchanged"),
        }
    }
}

// =============================================================================
// Cluster Store Port
// =============================================================================

/// Port for every read and write the reconcilers make against the cluster
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Create the object or bring the live one in line with it
    async fn create_or_patch(&self, object: ManagedObject) -> Result<PatchOutcome>;

    /// Delete an object; returns false when it was already absent.
    ///
    /// Deleting a dynamic object whose API the server does not serve fails
    /// with [`crate::Error::ApiNotServed`].
    async fn delete(&self, target: &ObjectRef) -> Result<bool>;

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;

    async fn list_daemonsets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>>;

    /// List nodes carrying every given label
    async fn list_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>>;

    /// Merge-patch node labels; a `None` value removes the label
    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    async fn get_cluster_policy(&self, name: &str) -> Result<Option<RBLNClusterPolicy>>;

    async fn list_cluster_policies(&self) -> Result<Vec<RBLNClusterPolicy>>;

    async fn patch_cluster_policy_status(
        &self,
        name: &str,
        status: &RBLNClusterPolicyStatus,
    ) -> Result<()>;

    async fn get_driver(&self, name: &str) -> Result<Option<RBLNDriver>>;

    async fn list_drivers(&self) -> Result<Vec<RBLNDriver>>;

    async fn patch_driver_status(&self, name: &str, status: &RBLNDriverStatus) -> Result<()>;
}

pub type ClusterStoreRef = Arc<dyn ClusterStore>;

// =============================================================================
// Component Patcher Port
// =============================================================================

/// One independently enabled workload managed for an owning custom resource
#[async_trait]
pub trait ComponentPatcher: Send + Sync {
    /// Stable component name used in status and logs
    fn name(&self) -> &str;

    fn namespace(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Create or update every object the component needs
    async fn converge(&self, owner: &OwnerReference) -> Result<()>;

    /// Delete every object the component may have created
    async fn tear_down(&self, owner: &OwnerReference) -> Result<()>;

    /// Judge the live workload; lookup failures become NotReady conditions
    async fn readiness_report(&self, owner: &OwnerReference) -> Vec<Condition>;
}

pub type ComponentPatcherRef = Box<dyn ComponentPatcher>;
