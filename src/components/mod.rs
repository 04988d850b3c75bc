//! Managed components
//!
//! One patcher per workload the operator deploys. Every patcher renders its
//! desired objects with the shared [`builders`], applies them in dependency
//! order through the [`ClusterStore`](crate::domain::ClusterStore) and judges
//! readiness from the live DaemonSet.
//!
//! ```text
//! ServiceAccount ──▶ Role/RoleBinding ──▶ ClusterRole/Binding ──▶ ConfigMap ──▶ DaemonSet ──▶ Service
//!                    (OpenShift only)
//! ```

pub mod builders;
pub mod container_toolkit;
pub mod device_config;
pub mod device_plugin;
pub mod dra_plugin;
pub mod driver_manager;
pub mod feature_discovery;
pub mod image;
pub mod metrics_exporter;
pub mod node_pool;
pub mod rbln_daemon;
pub mod readiness;
pub mod sandbox_device_plugin;
pub mod validator;
pub mod vfio_manager;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{debug, error, info};

use crate::crd::{ComponentSpec, ValidatorSpec};
use crate::domain::{ClusterStore, ClusterStoreRef, ManagedObject, ObjectKind, ObjectRef};
use crate::error::{Error, Result};

pub use container_toolkit::ContainerRuntime;

// =============================================================================
// Component Names
// =============================================================================

pub const VFIO_MANAGER: &str = "vfio-manager";
pub const SANDBOX_DEVICE_PLUGIN: &str = "sandbox-device-plugin";
pub const DEVICE_PLUGIN: &str = "device-plugin";
pub const METRICS_EXPORTER: &str = "metrics-exporter";
pub const NPU_FEATURE_DISCOVERY: &str = "npu-feature-discovery";
pub const CONTAINER_TOOLKIT: &str = "container-toolkit";
pub const OPERATOR_VALIDATOR: &str = "operator-validator";
pub const DRA_KUBELET_PLUGIN: &str = "dra-kubelet-plugin";
/// Not prefixed with the policy base name
pub const RBLN_DAEMON: &str = "rbln-daemon";
pub const RBLN_DRIVER: &str = "rbln-driver";

// =============================================================================
// Component Context
// =============================================================================

/// Everything a patcher needs besides its own spec
#[derive(Clone)]
pub struct ComponentContext {
    pub store: ClusterStoreRef,
    pub namespace: String,
    pub base_name: String,
    /// `major.minor` when running on OpenShift
    pub openshift_version: Option<String>,
    pub container_runtime: ContainerRuntime,
    /// Validator settings reused by the init containers of other components
    pub validator: ValidatorSpec,
}

impl ComponentContext {
    pub fn new(store: ClusterStoreRef, namespace: impl Into<String>, base_name: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            base_name: base_name.into(),
            openshift_version: None,
            container_runtime: ContainerRuntime::default(),
            validator: ValidatorSpec::default().with_defaults(None),
        }
    }

    pub fn with_openshift_version(mut self, version: Option<String>) -> Self {
        self.openshift_version = version.filter(|v| !v.is_empty());
        self
    }

    pub fn with_container_runtime(mut self, runtime: ContainerRuntime) -> Self {
        self.container_runtime = runtime;
        self
    }

    pub fn with_validator(mut self, validator: ValidatorSpec) -> Self {
        self.validator = validator;
        self
    }

    pub fn is_openshift(&self) -> bool {
        self.openshift_version.is_some()
    }

    /// `{base}-{component}`
    pub fn component_name(&self, component: &str) -> String {
        format!("{}-{}", self.base_name, component)
    }

    pub fn namespaced(&self, kind: ObjectKind, name: impl Into<String>) -> ObjectRef {
        ObjectRef::namespaced(kind, name, self.namespace.clone())
    }

    /// ServiceAccount `name`, plus the SCC Role and RoleBinding on OpenShift
    pub fn service_account_objects(&self, name: &str, owner: &OwnerReference) -> Vec<ManagedObject> {
        let mut objects = vec![builders::service_account(name, &self.namespace, owner)];
        if self.is_openshift() {
            objects.push(builders::role(name, &self.namespace, vec![builders::scc_rule()], owner));
            objects.push(builders::role_binding(name, &self.namespace, owner));
        }
        objects
    }

    /// Refs matching [`Self::service_account_objects`], in deletion order
    pub fn service_account_refs(&self, name: &str) -> Vec<ObjectRef> {
        let mut refs = Vec::new();
        if self.is_openshift() {
            refs.push(self.namespaced(ObjectKind::RoleBinding, name));
            refs.push(self.namespaced(ObjectKind::Role, name));
        }
        refs.push(self.namespaced(ObjectKind::ServiceAccount, name));
        refs
    }

    /// Image and pull policy of the validator, used by wait-for-marker init containers
    pub fn validator_image(&self) -> (String, String) {
        builders::component_image(self.validator.pod())
    }
}

// =============================================================================
// Apply and Delete
// =============================================================================

/// Create or patch `objects` in order, stopping at the first failure
pub async fn apply_objects(
    store: &dyn ClusterStore,
    component: &str,
    objects: Vec<ManagedObject>,
) -> Result<()> {
    for object in objects {
        let target = object.object_ref();
        match store.create_or_patch(object).await {
            Ok(outcome) => {
                info!(
                    component = %component,
                    object = %target,
                    result = %outcome,
                    "Reconciled object"
                );
            }
            Err(e) => {
                error!(component = %component, object = %target, error = %e, "Failed to reconcile object");
                return Err(Error::patch(component, e));
            }
        }
    }
    Ok(())
}

/// Delete `targets` in order; already absent objects are skipped
pub async fn delete_objects(store: &dyn ClusterStore, component: &str, targets: &[ObjectRef]) -> Result<()> {
    for target in targets {
        let deleted = store
            .delete(target)
            .await
            .map_err(|e| Error::clean_up(component, e))?;
        debug!(component = %component, object = %target, deleted, "Deleted object");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;
    use std::sync::Arc;

    #[test]
    fn test_openshift_adds_scc_rbac() {
        let store: ClusterStoreRef = Arc::new(FakeCluster::default());
        let owner = crate::testing::policy_owner();
        let ctx = ComponentContext::new(store, "rbln-system", "rbln");

        assert_eq!(ctx.service_account_objects("rbln-device-plugin", &owner).len(), 1);
        assert_eq!(ctx.service_account_refs("rbln-device-plugin").len(), 1);

        let ctx = ctx.with_openshift_version(Some("4.15".to_string()));
        let kinds: Vec<_> = ctx
            .service_account_objects("rbln-device-plugin", &owner)
            .iter()
            .map(ManagedObject::kind)
            .collect();
        assert_eq!(kinds, vec![ObjectKind::ServiceAccount, ObjectKind::Role, ObjectKind::RoleBinding]);

        let refs = ctx.service_account_refs("rbln-device-plugin");
        assert_eq!(refs.last().map(|r| r.kind.clone()), Some(ObjectKind::ServiceAccount));
    }

    #[test]
    fn test_empty_openshift_version_is_not_openshift() {
        let store: ClusterStoreRef = Arc::new(FakeCluster::default());
        let ctx = ComponentContext::new(store, "rbln-system", "rbln").with_openshift_version(Some(String::new()));
        assert!(!ctx.is_openshift());
        assert_eq!(ctx.component_name(DEVICE_PLUGIN), "rbln-device-plugin");
    }

    #[test]
    fn test_validator_image_defaults() {
        let store: ClusterStoreRef = Arc::new(FakeCluster::default());
        let ctx = ComponentContext::new(store, "rbln-system", "rbln");
        assert_eq!(
            ctx.validator_image(),
            ("rebellions/rbln-operator-validator:latest".to_string(), "Always".to_string())
        );
    }

    #[tokio::test]
    async fn test_apply_then_delete() {
        let cluster = Arc::new(FakeCluster::default());
        let owner = crate::testing::policy_owner();
        let objects = vec![
            builders::service_account("rbln-npu-feature-discovery", "rbln-system", &owner),
            builders::config_map("rbln-npu-feature-discovery-config", "rbln-system", Default::default(), &owner),
        ];
        apply_objects(cluster.as_ref(), NPU_FEATURE_DISCOVERY, objects).await.unwrap();
        assert_eq!(cluster.object_count(), 2);

        let refs = vec![
            ObjectRef::namespaced(ObjectKind::ConfigMap, "rbln-npu-feature-discovery-config", "rbln-system"),
            ObjectRef::namespaced(ObjectKind::ServiceAccount, "rbln-npu-feature-discovery", "rbln-system"),
            ObjectRef::namespaced(ObjectKind::Role, "rbln-npu-feature-discovery", "rbln-system"),
        ];
        delete_objects(cluster.as_ref(), NPU_FEATURE_DISCOVERY, &refs).await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }
}
