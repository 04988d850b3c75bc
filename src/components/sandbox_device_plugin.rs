//! Sandbox device plugin
//!
//! Advertises vfio-bound NPUs for VM passthrough. An init container blocks
//! until the VFIO manager has bound every device.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;
use tracing::warn;

use super::builders::{self, DaemonSetBuilder};
use super::device_config::{self, VFIO_DRIVER};
use super::device_plugin::{plugin_mounts, plugin_volumes, CONFIG_KEY};
use super::image::{compose_image_reference, tagged_image};
use super::vfio_manager::{self, VFIO_SCRIPT_KEY, VFIO_SCRIPT_PATH};
use super::{apply_objects, delete_objects, readiness, ComponentContext, SANDBOX_DEVICE_PLUGIN, VFIO_MANAGER};
use crate::crd::{ComponentSpec, Condition, RBLNClusterPolicySpec, SandboxDevicePluginSpec};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::Result;

const VFIO_BIND_CHECK: &str = r#"TIMEOUT=300
START=$(date +%s)
until /bin/vfio-manage.sh check_bind --all; do
    if [ $(($(date +%s) - $START)) -gt $TIMEOUT ]; then
        echo "Timeout waiting for VFIO-PCI binding"
        exit 1
    fi
    echo "Waiting for all VFIO-PCI bindings..."
    sleep 2
done
echo "VFIO-PCI binding check completed.""#;

pub struct SandboxDevicePlugin {
    ctx: ComponentContext,
    name: String,
    spec: Option<SandboxDevicePluginSpec>,
}

impl SandboxDevicePlugin {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let spec = policy
            .sandbox_device_plugin
            .as_ref()
            .filter(|spec| spec.is_enabled())
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self {
            name: ctx.component_name(SANDBOX_DEVICE_PLUGIN),
            ctx,
            spec,
        }
    }

    fn config_map_name(&self) -> String {
        format!("{}-config", self.name)
    }

    fn bind_checker(&self, spec: &SandboxDevicePluginSpec, script_volume: &str) -> Container {
        let checker = &spec.vfio_checker;
        let reference = compose_image_reference(
            checker.registry.as_deref().unwrap_or_default(),
            checker
                .image
                .as_deref()
                .filter(|image| !image.is_empty())
                .unwrap_or(vfio_manager_image()),
        );
        let (image, pull_policy) = tagged_image(&reference, checker.version.as_deref(), spec.pod.pull_policy());
        Container {
            name: "vfio-bind-checker".to_string(),
            image: Some(image),
            image_pull_policy: Some(pull_policy),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), VFIO_BIND_CHECK.to_string()]),
            security_context: builders::privileged(),
            volume_mounts: Some(vec![builders::sub_path_mount(script_volume, VFIO_SCRIPT_PATH, VFIO_SCRIPT_KEY)]),
            ..Default::default()
        }
    }

    fn desired_objects(&self, spec: &SandboxDevicePluginSpec, owner: &OwnerReference) -> Result<Vec<ManagedObject>> {
        let namespace = &self.ctx.namespace;
        let config = device_config::render_config(&spec.resource_list, VFIO_DRIVER)?;
        let script_volume = self.ctx.component_name(VFIO_MANAGER);

        let mut objects = self.ctx.service_account_objects(&self.name, owner);
        objects.push(builders::config_map(
            &self.config_map_name(),
            namespace,
            BTreeMap::from([(CONFIG_KEY.to_string(), config)]),
            owner,
        ));

        let pod = &spec.pod;
        let container = Container {
            volume_mounts: Some(plugin_mounts()),
            ..builders::component_container(&self.name, pod)
        };

        let mut volumes = plugin_volumes(&self.config_map_name());
        volumes.push(builders::config_map_volume(
            &script_volume,
            &vfio_manager::config_map_name(&self.ctx.base_name),
            VFIO_SCRIPT_KEY,
            None,
            Some(0o700),
        ));

        let pod_spec = PodSpec {
            init_containers: Some(vec![self.bind_checker(spec, &script_volume)]),
            containers: vec![container],
            volumes: Some(volumes),
            ..builders::component_pod_spec(pod, &self.name, builders::deploy_selector(SANDBOX_DEVICE_PLUGIN))
        };

        objects.push(
            DaemonSetBuilder::new(&self.name, namespace, owner)
                .selector_labels(builders::app_labels(&self.name))
                .labels(&pod.labels)
                .annotations(&pod.annotations)
                .pod_spec(pod_spec)
                .build(),
        );
        Ok(objects)
    }

    fn owned_refs(&self) -> Vec<ObjectRef> {
        let mut refs = vec![
            self.ctx.namespaced(ObjectKind::DaemonSet, self.name.clone()),
            self.ctx.namespaced(ObjectKind::ConfigMap, self.config_map_name()),
        ];
        refs.extend(self.ctx.service_account_refs(&self.name));
        refs
    }
}

fn vfio_manager_image() -> &'static str {
    <crate::crd::VfioManagerSpec as ComponentSpec>::DEFAULT_IMAGE
}

#[async_trait]
impl ComponentPatcher for SandboxDevicePlugin {
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
        let objects = self.desired_objects(spec, owner)?;
        apply_objects(self.ctx.store.as_ref(), &self.name, objects).await
    }

    async fn tear_down(&self, _owner: &OwnerReference) -> Result<()> {
        warn!(component = %self.name, "Sandbox device plugin is disabled, removing its resources");
        delete_objects(self.ctx.store.as_ref(), &self.name, &self.owned_refs()).await
    }

    async fn readiness_report(&self, _owner: &OwnerReference) -> Vec<Condition> {
        readiness::daemonset_report(self.ctx.store.as_ref(), &self.ctx.namespace, &self.name).await
    }
}
