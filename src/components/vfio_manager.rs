//! VFIO manager
//!
//! Binds every NPU on a VM passthrough node to `vfio-pci` and unbinds them
//! again when its pod stops. The bind script ships in a ConfigMap that the
//! sandbox device plugin mounts as well.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec, SELinuxOptions, SecurityContext};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;
use tracing::warn;

use super::builders::{self, DaemonSetBuilder};
use super::{apply_objects, delete_objects, readiness, ComponentContext, VFIO_MANAGER};
use crate::crd::{ComponentSpec, Condition, RBLNClusterPolicySpec, VfioManagerSpec};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::Result;

pub const VFIO_SCRIPT_KEY: &str = "vfio-manage.sh";
pub const VFIO_SCRIPT_PATH: &str = "/bin/vfio-manage.sh";
const VFIO_SCRIPT: &str = include_str!("../../assets/vfio-manage.sh");

/// Name of the ConfigMap carrying the bind script
pub fn config_map_name(base_name: &str) -> String {
    format!("{}-{}-config", base_name, VFIO_MANAGER)
}

pub struct VfioManager {
    ctx: ComponentContext,
    name: String,
    spec: Option<VfioManagerSpec>,
}

impl VfioManager {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let spec = policy
            .vfio_manager
            .as_ref()
            .filter(|spec| spec.is_enabled())
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self {
            name: ctx.component_name(VFIO_MANAGER),
            ctx,
            spec,
        }
    }

    fn desired_objects(&self, spec: &VfioManagerSpec, owner: &OwnerReference) -> Vec<ManagedObject> {
        let namespace = &self.ctx.namespace;
        let cm_name = config_map_name(&self.ctx.base_name);

        let mut objects = self.ctx.service_account_objects(&self.name, owner);
        objects.push(builders::config_map(
            &cm_name,
            namespace,
            BTreeMap::from([(VFIO_SCRIPT_KEY.to_string(), VFIO_SCRIPT.to_string())]),
            owner,
        ));

        let pod = &spec.pod;
        let mut container = builders::component_container(&self.name, pod);
        container.resources = Some(builders::requests_with_defaults(pod.resources.as_ref(), "100m", "200Mi"));
        let container = Container {
            command: builders::strings(&["/bin/bash", "-c"]),
            args: Some(vec![format!("{} bind --all && sleep inf", VFIO_SCRIPT_PATH)]),
            volume_mounts: Some(vec![
                builders::sub_path_mount(&self.name, VFIO_SCRIPT_PATH, VFIO_SCRIPT_KEY),
                builders::mount("host-sys", "/sys"),
                builders::mount("host-root", "/host"),
            ]),
            security_context: Some(SecurityContext {
                run_as_user: Some(0),
                privileged: Some(true),
                se_linux_options: Some(SELinuxOptions {
                    level: Some("s0".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            lifecycle: builders::pre_stop(&["/bin/sh", "-c", &format!("{} unbind --all", VFIO_SCRIPT_PATH)]),
            ..container
        };

        let pod_spec = PodSpec {
            termination_grace_period_seconds: Some(30),
            containers: vec![container],
            volumes: Some(vec![
                builders::config_map_volume(&self.name, &cm_name, VFIO_SCRIPT_KEY, None, Some(0o700)),
                builders::host_path_volume("host-sys", "/sys", Some("Directory")),
                builders::host_path_volume("host-root", "/", Some("Directory")),
            ]),
            ..builders::component_pod_spec(pod, &self.name, builders::deploy_selector(VFIO_MANAGER))
        };

        objects.push(
            DaemonSetBuilder::new(&self.name, namespace, owner)
                .selector_labels(builders::app_labels(&self.name))
                .labels(&pod.labels)
                .annotations(&pod.annotations)
                .pod_spec(pod_spec)
                .build(),
        );
        objects
    }

    fn owned_refs(&self) -> Vec<ObjectRef> {
        let mut refs = vec![
            self.ctx.namespaced(ObjectKind::DaemonSet, self.name.clone()),
            self.ctx.namespaced(ObjectKind::ConfigMap, config_map_name(&self.ctx.base_name)),
        ];
        refs.extend(self.ctx.service_account_refs(&self.name));
        refs
    }
}

#[async_trait]
impl ComponentPatcher for VfioManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.ctx.namespace
    }

    fn is_enabled(&self) -> bool {
        self.spec.is_some()
    }

    async fn converge(&self, owner: &OwnerReference) -> Result<()> {
        let Some(spec) = &self.spec else {
            return Ok(());
        };
        apply_objects(self.ctx.store.as_ref(), &self.name, self.desired_objects(spec, owner)).await
    }

    async fn tear_down(&self, _owner: &OwnerReference) -> Result<()> {
        warn!(component = %self.name, "VFIO manager is disabled, removing its resources");
        delete_objects(self.ctx.store.as_ref(), &self.name, &self.owned_refs()).await
    }

    async fn readiness_report(&self, _owner: &OwnerReference) -> Vec<Condition> {
        readiness::daemonset_report(self.ctx.store.as_ref(), &self.ctx.namespace, &self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{policy_owner, FakeCluster};
    use std::sync::Arc;

    fn policy() -> RBLNClusterPolicySpec {
        serde_json::from_value(serde_json::json!({
            "workloadType": "vm-passthrough",
            "vfioManager": { "registry": "repo.rebellions.ai", "version": "0.2.0" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_converge_creates_script_and_daemonset() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = ComponentContext::new(cluster.clone(), "rbln-system", "rbln");
        let patcher = VfioManager::new(ctx, &policy());
        assert!(patcher.is_enabled());

        patcher.converge(&policy_owner()).await.unwrap();

        let cm = cluster
            .object(&ObjectRef::namespaced(ObjectKind::ConfigMap, "rbln-vfio-manager-config", "rbln-system"))
            .unwrap();
        assert!(cm["data"]["vfio-manage.sh"].as_str().unwrap().starts_with("#!/bin/bash"));

        let ds = cluster.daemonset("rbln-system", "rbln-vfio-manager").unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.node_selector.unwrap().get("rebellions.ai/npu.deploy.vfio-manager").map(String::as_str),
            Some("true")
        );
        assert_eq!(pod.priority_class_name.as_deref(), Some("system-node-critical"));
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("repo.rebellions.ai/rebellions/rbln-vfio-manager:0.2.0"));
        let requests = container.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["memory"].0, "200Mi");
        assert!(container.lifecycle.as_ref().unwrap().pre_stop.is_some());
    }

    #[tokio::test]
    async fn test_tear_down_removes_everything() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = ComponentContext::new(cluster.clone(), "rbln-system", "rbln")
            .with_openshift_version(Some("4.16".to_string()));
        let patcher = VfioManager::new(ctx, &policy());

        patcher.converge(&policy_owner()).await.unwrap();
        assert_eq!(cluster.object_count(), 5);

        patcher.tear_down(&policy_owner()).await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }

    #[test]
    fn test_disabled_block() {
        let spec: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({
            "vfioManager": { "enabled": false }
        }))
        .unwrap();
        let ctx = ComponentContext::new(Arc::new(FakeCluster::default()), "rbln-system", "rbln");
        assert!(!VfioManager::new(ctx, &spec).is_enabled());
    }
}
