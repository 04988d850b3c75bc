//! Device plugin for container workloads
//!
//! Advertises NPUs bound to the `rebellions` kernel driver as extended
//! resources. The resource list is rendered into `{name}-config` and read by
//! the plugin from `/etc/pcidp/config.json`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;
use tracing::warn;

use super::builders::{self, DaemonSetBuilder};
use super::device_config::{self, KERNEL_DRIVER};
use super::{apply_objects, delete_objects, readiness, ComponentContext, DEVICE_PLUGIN};
use crate::crd::{ComponentSpec, Condition, DevicePluginSpec, RBLNClusterPolicySpec};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::Result;

pub const CONFIG_KEY: &str = "config.json";
const CONFIG_VOLUME: &str = "config-volume";
const HOST_BIN_VOLUME: &str = "host-bin";
const RBLN_SMI: &str = "rbln-smi";

/// Volumes both device plugin flavors mount
pub(crate) fn plugin_volumes(config_map: &str) -> Vec<Volume> {
    vec![
        builders::host_path_volume("devicesock", "/var/lib/kubelet/device-plugin", None),
        builders::host_path_volume("plugins-registry", "/var/lib/kubelet/plugins_registry", None),
        builders::host_path_volume("log", "/var/log", None),
        builders::host_path_volume("device-info", "/var/run/k8s.cni.cncf.io/devinfo/dp", Some("DirectoryOrCreate")),
        builders::config_map_volume(CONFIG_VOLUME, config_map, CONFIG_KEY, None, None),
    ]
}

pub(crate) fn plugin_mounts() -> Vec<VolumeMount> {
    vec![
        builders::mount("devicesock", "/var/lib/kubelet/device-plugins"),
        builders::mount("plugins-registry", "/var/lib/kubelet/plugins_registry"),
        builders::mount("log", "/var/log"),
        builders::mount("device-info", "/var/run/k8s.cni.cncf.io/devinfo/dp"),
        builders::mount(CONFIG_VOLUME, "/etc/pcidp"),
    ]
}

pub struct DevicePlugin {
    ctx: ComponentContext,
    name: String,
    spec: Option<DevicePluginSpec>,
}

impl DevicePlugin {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let spec = policy
            .device_plugin
            .as_ref()
            .filter(|spec| spec.is_enabled())
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self {
            name: ctx.component_name(DEVICE_PLUGIN),
            ctx,
            spec,
        }
    }

    fn config_map_name(&self) -> String {
        format!("{}-config", self.name)
    }

    fn desired_objects(&self, spec: &DevicePluginSpec, owner: &OwnerReference) -> Result<Vec<ManagedObject>> {
        let namespace = &self.ctx.namespace;
        let config = device_config::render_config(&spec.resource_list, KERNEL_DRIVER)?;
        let host_bin = if spec.host_bin_path.is_empty() {
            "/usr/bin"
        } else {
            spec.host_bin_path.as_str()
        };

        let mut objects = self.ctx.service_account_objects(&self.name, owner);
        objects.push(builders::config_map(
            &self.config_map_name(),
            namespace,
            BTreeMap::from([(CONFIG_KEY.to_string(), config)]),
            owner,
        ));

        let pod = &spec.pod;
        let mut mounts = plugin_mounts();
        mounts.push(builders::sub_path_mount(
            HOST_BIN_VOLUME,
            &format!("{}/{}", host_bin.trim_end_matches('/'), RBLN_SMI),
            RBLN_SMI,
        ));
        mounts.push(builders::mount("host-dev", "/dev"));
        mounts.push(builders::mount("host-sys", "/sys"));

        let container = Container {
            volume_mounts: Some(mounts),
            security_context: builders::privileged(),
            ..builders::component_container(&self.name, pod)
        };

        let mut volumes = plugin_volumes(&self.config_map_name());
        volumes.push(builders::host_path_volume("host-sys", "/sys", Some("Directory")));
        volumes.push(builders::host_path_volume("host-dev", "/dev", Some("Directory")));
        volumes.push(builders::host_path_volume(HOST_BIN_VOLUME, host_bin, Some("Directory")));

        let pod_spec = PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            ..builders::component_pod_spec(pod, &self.name, builders::deploy_selector(DEVICE_PLUGIN))
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

#[async_trait]
impl ComponentPatcher for DevicePlugin {
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
        warn!(component = %self.name, "Device plugin is disabled, removing its resources");
        delete_objects(self.ctx.store.as_ref(), &self.name, &self.owned_refs()).await
    }

    async fn readiness_report(&self, _owner: &OwnerReference) -> Vec<Condition> {
        readiness::daemonset_report(self.ctx.store.as_ref(), &self.ctx.namespace, &self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::testing::{policy_owner, FakeCluster};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_config_map_carries_resource_list() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({
            "devicePlugin": {
                "hostBinPath": "/opt/bin/",
                "resourceList": [{ "resourceName": "ATOM_MAX", "productCardNames": ["RBLN-CA25"] }]
            }
        }))
        .unwrap();
        let patcher = DevicePlugin::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), &spec);
        patcher.converge(&policy_owner()).await.unwrap();

        let cm = cluster
            .object(&ObjectRef::namespaced(ObjectKind::ConfigMap, "rbln-device-plugin-config", "rbln-system"))
            .unwrap();
        let config: serde_json::Value = serde_json::from_str(cm["data"]["config.json"].as_str().unwrap()).unwrap();
        assert_eq!(config["resourceList"][0]["resourceName"], "ATOM_MAX");
        assert_eq!(config["resourceList"][0]["selectors"]["devices"], serde_json::json!(["1250", "1251"]));

        let ds = cluster.daemonset("rbln-system", "rbln-device-plugin").unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        let smi = mounts.iter().find(|m| m.name == "host-bin").unwrap();
        assert_eq!(smi.mount_path, "/opt/bin/rbln-smi");
        assert_eq!(smi.sub_path.as_deref(), Some("rbln-smi"));
    }

    #[tokio::test]
    async fn test_unknown_card_fails_converge() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({
            "devicePlugin": { "resourceList": [{ "productCardNames": ["RBLN-ZZ00"] }] }
        }))
        .unwrap();
        let patcher = DevicePlugin::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), &spec);

        let err = patcher.converge(&policy_owner()).await.unwrap_err();
        assert_matches!(err, Error::Configuration(msg) if msg.contains("RBLN-ZZ00"));
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_readiness_follows_daemonset() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({ "devicePlugin": {} })).unwrap();
        let patcher = DevicePlugin::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), &spec);
        let owner = policy_owner();

        let report = patcher.readiness_report(&owner).await;
        assert_eq!(report[0].reason, "DeamonSetNotFound");

        patcher.converge(&owner).await.unwrap();
        cluster.set_daemonset_status("rbln-system", "rbln-device-plugin", 2, 2, 0);
        let report = patcher.readiness_report(&owner).await;
        assert!(report[0].is_true());
    }
}
