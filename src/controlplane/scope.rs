//! Reconciliation scopes
//!
//! A scope is rebuilt on every pass from the owning object. It fixes the
//! component order once, at construction, and drives every component
//! through converge or teardown in that order.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use super::cluster_info::ClusterInfo;
use super::status::component_status;
use crate::components::container_toolkit::ContainerToolkit;
use crate::components::device_plugin::DevicePlugin;
use crate::components::dra_plugin::DraKubeletPlugin;
use crate::components::driver_manager::DriverManager;
use crate::components::feature_discovery::FeatureDiscovery;
use crate::components::metrics_exporter::MetricsExporter;
use crate::components::rbln_daemon::RblnDaemon;
use crate::components::sandbox_device_plugin::SandboxDevicePlugin;
use crate::components::validator::Validator;
use crate::components::vfio_manager::VfioManager;
use crate::components::ComponentContext;
use crate::crd::{ComponentSpec, ComponentStatus, RBLNClusterPolicy, RBLNDriver};
use crate::domain::{ClusterStoreRef, ComponentPatcherRef};
use crate::error::{Error, Result};

const NAMESPACE_NOT_CONFIGURED: &str =
    "namespace is not configured. Set OPERATOR_NAMESPACE env variable or namespace spec";

fn owner_reference<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner
        .controller_owner_ref(&())
        .ok_or_else(|| Error::Internal(format!("{} has no uid", owner.meta().name.as_deref().unwrap_or_default())))
}

fn resolve_namespace(policy: &RBLNClusterPolicy, operator_namespace: Option<&str>) -> Result<String> {
    policy
        .spec
        .target_namespace(operator_namespace)
        .ok_or_else(|| Error::Configuration(NAMESPACE_NOT_CONFIGURED.to_string()))
}

fn component_context(
    store: ClusterStoreRef,
    policy: &RBLNClusterPolicy,
    namespace: String,
    info: &ClusterInfo,
) -> ComponentContext {
    let spec = &policy.spec;
    let validator = spec
        .validator
        .clone()
        .unwrap_or_default()
        .with_defaults(spec.daemonsets.as_ref());
    ComponentContext::new(store, namespace, spec.base_name.clone())
        .with_openshift_version(info.openshift_version.clone())
        .with_container_runtime(info.container_runtime.unwrap_or_default())
        .with_validator(validator)
}

/// Ordered component patchers for one owner
pub struct Scope {
    owner: OwnerReference,
    patchers: Vec<ComponentPatcherRef>,
}

impl Scope {
    pub fn new(owner: OwnerReference, patchers: Vec<ComponentPatcherRef>) -> Self {
        Self { owner, patchers }
    }

    /// Scope of every component an RBLNClusterPolicy manages
    pub fn for_cluster_policy(
        store: ClusterStoreRef,
        policy: &RBLNClusterPolicy,
        operator_namespace: Option<&str>,
        info: &ClusterInfo,
    ) -> Result<Self> {
        let owner = owner_reference(policy)?;
        let namespace = resolve_namespace(policy, operator_namespace)?;
        let ctx = component_context(store, policy, namespace, info);
        let spec = &policy.spec;

        let patchers: Vec<ComponentPatcherRef> = vec![
            Box::new(VfioManager::new(ctx.clone(), spec)),
            Box::new(SandboxDevicePlugin::new(ctx.clone(), spec)),
            Box::new(ContainerToolkit::new(ctx.clone(), spec)),
            Box::new(Validator::new(ctx.clone(), spec)),
            Box::new(RblnDaemon::new(ctx.clone(), spec)),
            Box::new(DevicePlugin::new(ctx.clone(), spec)),
            Box::new(DraKubeletPlugin::new(ctx.clone(), spec)),
            Box::new(MetricsExporter::new(ctx.clone(), spec)),
            Box::new(FeatureDiscovery::new(ctx, spec)),
        ];
        debug!(policy = %policy.name_any(), runtime = %info.container_runtime.unwrap_or_default(), "Built cluster policy scope");
        Ok(Self::new(owner, patchers))
    }

    /// Scope of the driver installer for one RBLNDriver.
    ///
    /// Components land in the namespace of the cluster policy.
    pub fn for_driver(
        store: ClusterStoreRef,
        driver: &RBLNDriver,
        policy: &RBLNClusterPolicy,
        operator_namespace: Option<&str>,
        info: &ClusterInfo,
    ) -> Result<Self> {
        let owner = owner_reference(driver)?;
        let namespace = resolve_namespace(policy, operator_namespace)?;
        let ctx = ComponentContext::new(store, namespace, policy.spec.base_name.clone())
            .with_openshift_version(info.openshift_version.clone());
        Ok(Self::new(owner, vec![Box::new(DriverManager::new(ctx, driver))]))
    }

    pub fn owner(&self) -> &OwnerReference {
        &self.owner
    }

    pub fn patchers(&self) -> &[ComponentPatcherRef] {
        &self.patchers
    }

    /// Converge enabled components and tear down disabled ones, in order.
    ///
    /// The first failure stops the pass.
    pub async fn patch_components(&self) -> Result<()> {
        for patcher in &self.patchers {
            if patcher.is_enabled() {
                debug!(component = %patcher.name(), "Converging component");
                patcher.converge(&self.owner).await?;
            } else {
                patcher.tear_down(&self.owner).await?;
            }
        }
        info!(owner = %self.owner.name, components = self.patchers.len(), "Patched components");
        Ok(())
    }

    /// One status per enabled component, in scope order
    pub async fn assemble_component_conditions(&self) -> Vec<ComponentStatus> {
        let mut statuses = Vec::new();
        for patcher in self.patchers.iter().filter(|p| p.is_enabled()) {
            let conditions = patcher.readiness_report(&self.owner).await;
            statuses.push(component_status(patcher.name(), patcher.namespace(), conditions));
        }
        statuses
    }
}
