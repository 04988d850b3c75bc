//! DRA kubelet plugin
//!
//! Publishes NPUs as ResourceSlices for Dynamic Resource Allocation. The
//! class that claims refer to is registered as a `DeviceClass` on the newest
//! `resource.k8s.io` version the server serves, or as a `v1alpha2`
//! `ResourceClass` on clusters that predate DeviceClass. Only one of the two
//! exists at a time.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, GRPCAction, PodSpec, Probe};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use tracing::{debug, info, warn};

use super::builders::{self, DaemonSetBuilder, VALIDATIONS_PATH, VALIDATIONS_VOLUME};
use super::container_toolkit::CDI_ROOT;
use super::{apply_objects, delete_objects, readiness, ComponentContext, DEVICE_PLUGIN, DRA_KUBELET_PLUGIN};
use crate::crd::{ComponentSpec, Condition, DraKubeletPluginSpec, RBLNClusterPolicySpec, DEFAULT_DRA_DRIVER_NAME};
use crate::domain::{ClusterStore, ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::{Error, Result};

pub const RESOURCE_GROUP: &str = "resource.k8s.io";
/// DeviceClass versions, newest first
pub const DEVICE_CLASS_VERSIONS: [&str; 3] = ["v1", "v1beta2", "v1beta1"];
pub const RESOURCE_CLASS_VERSION: &str = "v1alpha2";
const DEVICE_CLASS: &str = "DeviceClass";
const RESOURCE_CLASS: &str = "ResourceClass";
const PLUGIN_COMMAND: &str = "npu-kubelet-plugin";
/// Extended resource the DeviceClass maps to
pub const EXTENDED_RESOURCE_NAME: &str = "rebellions.ai/npu";

fn api_version(version: &str) -> String {
    format!("{}/{}", RESOURCE_GROUP, version)
}

fn class_object(version: &str, kind: &str, name: &str, data: serde_json::Value, owner: &OwnerReference) -> DynamicObject {
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(RESOURCE_GROUP, version, kind));
    let mut object = DynamicObject::new(name, &resource).data(data);
    object.metadata.owner_references = Some(vec![owner.clone()]);
    object
}

/// DeviceClass selecting every device published by `driver`
pub fn device_class(version: &str, driver: &str, owner: &OwnerReference) -> ManagedObject {
    let data = serde_json::json!({
        "spec": {
            "selectors": [{
                "cel": { "expression": format!("device.driver == {:?}", driver) }
            }],
            "extendedResourceName": EXTENDED_RESOURCE_NAME,
        }
    });
    ManagedObject::Dynamic(class_object(version, DEVICE_CLASS, driver, data, owner))
}

/// Legacy ResourceClass handled by `driver`
pub fn resource_class(driver: &str, owner: &OwnerReference) -> ManagedObject {
    let data = serde_json::json!({ "driverName": driver });
    ManagedObject::Dynamic(class_object(RESOURCE_CLASS_VERSION, RESOURCE_CLASS, driver, data, owner))
}

fn device_class_ref(version: &str, name: &str) -> ObjectRef {
    ObjectRef::dynamic(&api_version(version), DEVICE_CLASS, name)
}

fn resource_class_ref(name: &str) -> ObjectRef {
    ObjectRef::dynamic(&api_version(RESOURCE_CLASS_VERSION), RESOURCE_CLASS, name)
}

/// Delete an object, treating an API the server does not serve as absent
async fn delete_if_served(store: &dyn ClusterStore, component: &str, target: &ObjectRef) -> Result<()> {
    match store.delete(target).await {
        Ok(deleted) => {
            debug!(component = %component, object = %target, deleted, "Deleted object");
            Ok(())
        }
        Err(Error::ApiNotServed { .. }) => {
            debug!(component = %component, object = %target, "API not served, nothing to delete");
            Ok(())
        }
        Err(e) => Err(Error::clean_up(component, e)),
    }
}

pub struct DraKubeletPlugin {
    ctx: ComponentContext,
    name: String,
    spec: Option<DraKubeletPluginSpec>,
    /// Class name, kept for a disabled block so teardown finds its class
    class_name: String,
    toolkit_enabled: bool,
}

impl DraKubeletPlugin {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let class_name = policy
            .dra_kubelet_plugin
            .as_ref()
            .map(|spec| spec.driver_name.as_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_DRA_DRIVER_NAME)
            .to_string();
        let spec = policy
            .dra_kubelet_plugin
            .as_ref()
            .filter(|spec| spec.is_enabled())
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self {
            name: ctx.component_name(DRA_KUBELET_PLUGIN),
            toolkit_enabled: policy.container_toolkit_enabled(),
            class_name,
            ctx,
            spec,
        }
    }

    fn role_name(&self) -> String {
        format!("{}-role", self.name)
    }

    fn binding_name(&self) -> String {
        format!("{}-rolebinding", self.name)
    }

    fn rbac_objects(&self, owner: &OwnerReference) -> Vec<ManagedObject> {
        let mut objects = self.ctx.service_account_objects(&self.name, owner);
        objects.push(builders::cluster_role(
            &self.role_name(),
            vec![
                builders::rule(&[RESOURCE_GROUP], &["resourceclaims"], &["get"]),
                builders::rule(&[RESOURCE_GROUP], &["deviceclasses", "resourceclasses"], &["get", "list", "watch"]),
                builders::rule(&[""], &["nodes"], &["get"]),
                builders::rule(
                    &[RESOURCE_GROUP],
                    &["resourceslices"],
                    &["get", "list", "watch", "create", "update", "patch", "delete"],
                ),
            ],
            owner,
        ));
        objects.push(builders::cluster_role_binding(
            &self.binding_name(),
            &self.role_name(),
            &self.name,
            &self.ctx.namespace,
            owner,
        ));
        objects
    }

    /// Register the class on the newest served API and remove the others
    async fn ensure_class(&self, driver: &str, owner: &OwnerReference) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let mut unserved = Vec::new();

        for version in DEVICE_CLASS_VERSIONS {
            match store.create_or_patch(device_class(version, driver, owner)).await {
                Ok(outcome) => {
                    info!(component = %self.name, version, result = %outcome, "Reconciled DeviceClass");
                    delete_if_served(store, &self.name, &resource_class_ref(driver)).await?;
                    for version in unserved {
                        delete_if_served(store, &self.name, &device_class_ref(version, driver)).await?;
                    }
                    return Ok(());
                }
                Err(Error::ApiNotServed { .. }) => {
                    debug!(component = %self.name, version, "DeviceClass version not served");
                    unserved.push(version);
                }
                Err(e) => return Err(Error::patch(&self.name, e)),
            }
        }

        info!(component = %self.name, "DeviceClass APIs are not available. Falling back to ResourceClass");
        store
            .create_or_patch(resource_class(driver, owner))
            .await
            .map_err(|e| Error::patch(&self.name, e))?;
        for version in DEVICE_CLASS_VERSIONS {
            delete_if_served(store, &self.name, &device_class_ref(version, driver)).await?;
        }
        Ok(())
    }

    fn daemonset(&self, spec: &DraKubeletPluginSpec, owner: &OwnerReference) -> ManagedObject {
        let pod = &spec.pod;
        let registrar = spec.kubelet_registrar_directory_path.as_str();
        let plugins = spec.kubelet_plugins_directory_path.as_str();

        let mut env = vec![
            builders::env_value("DRIVER_NAME", &self.class_name),
            builders::env_value("CDI_ROOT", CDI_ROOT),
            builders::env_value("KUBELET_REGISTRAR_DIRECTORY_PATH", registrar),
            builders::env_value("KUBELET_PLUGINS_DIRECTORY_PATH", plugins),
            builders::env_field("NODE_NAME", "spec.nodeName"),
            builders::env_field("NAMESPACE", "metadata.namespace"),
        ];
        let mut liveness_probe = None;
        if spec.healthcheck_port > 0 {
            env.push(builders::env_value("HEALTHCHECK_PORT", &spec.healthcheck_port.to_string()));
            liveness_probe = Some(Probe {
                grpc: Some(GRPCAction {
                    port: spec.healthcheck_port,
                    service: Some("liveness".to_string()),
                }),
                failure_threshold: Some(3),
                period_seconds: Some(10),
                ..Default::default()
            });
        }

        let container = Container {
            command: builders::strings(&[PLUGIN_COMMAND]),
            env: Some(env),
            liveness_probe,
            security_context: builders::privileged(),
            volume_mounts: Some(vec![
                builders::mount(VALIDATIONS_VOLUME, VALIDATIONS_PATH),
                builders::mount("plugins-registry", registrar),
                builders::mount("plugins", plugins),
                builders::mount("cdi", CDI_ROOT),
                builders::mount("host-dev", "/dev"),
                builders::mount("host-run-rbln", "/run/rbln"),
                builders::read_only_mount("host-usr-bin", "/host/usr/bin"),
            ]),
            ..builders::component_container(&self.name, pod)
        };

        let (validator_image, validator_pull) = self.ctx.validator_image();
        let pod_spec = PodSpec {
            init_containers: Some(vec![builders::wait_for_marker(
                "toolkit-validation",
                &validator_image,
                &validator_pull,
                "toolkit",
            )]),
            containers: vec![container],
            volumes: Some(vec![
                builders::validations_volume(),
                builders::host_path_volume("plugins-registry", registrar, Some("DirectoryOrCreate")),
                builders::host_path_volume("plugins", plugins, Some("DirectoryOrCreate")),
                builders::host_path_volume("cdi", CDI_ROOT, Some("DirectoryOrCreate")),
                builders::host_path_volume("host-dev", "/dev", Some("Directory")),
                builders::host_path_volume("host-run-rbln", "/run/rbln", Some("DirectoryOrCreate")),
                builders::host_path_volume("host-usr-bin", "/usr/bin", Some("Directory")),
            ]),
            ..builders::component_pod_spec(pod, &self.name, builders::deploy_selector(DEVICE_PLUGIN))
        };

        DaemonSetBuilder::new(&self.name, &self.ctx.namespace, owner)
            .selector_labels(builders::app_labels(&self.name))
            .labels(&pod.labels)
            .annotations(&pod.annotations)
            .pod_spec(pod_spec)
            .build()
    }
}

#[async_trait]
impl ComponentPatcher for DraKubeletPlugin {
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
        if !self.toolkit_enabled {
            return Err(Error::patch(
                &self.name,
                Error::Configuration("DRA kubelet plugin requires containerToolkit to be enabled".to_string()),
            ));
        }

        let store = self.ctx.store.as_ref();
        apply_objects(store, &self.name, self.rbac_objects(owner)).await?;
        self.ensure_class(&self.class_name, owner).await?;
        apply_objects(store, &self.name, vec![self.daemonset(spec, owner)]).await
    }

    async fn tear_down(&self, _owner: &OwnerReference) -> Result<()> {
        warn!(component = %self.name, "DRA kubelet plugin is disabled, removing its resources");
        let store = self.ctx.store.as_ref();
        delete_objects(store, &self.name, &[self.ctx.namespaced(ObjectKind::DaemonSet, self.name.clone())]).await?;

        for version in DEVICE_CLASS_VERSIONS {
            delete_if_served(store, &self.name, &device_class_ref(version, &self.class_name)).await?;
        }
        delete_if_served(store, &self.name, &resource_class_ref(&self.class_name)).await?;

        let mut refs = vec![
            ObjectRef::cluster(ObjectKind::ClusterRoleBinding, self.binding_name()),
            ObjectRef::cluster(ObjectKind::ClusterRole, self.role_name()),
        ];
        refs.extend(self.ctx.service_account_refs(&self.name));
        delete_objects(store, &self.name, &refs).await
    }

    async fn readiness_report(&self, _owner: &OwnerReference) -> Vec<Condition> {
        readiness::daemonset_report(self.ctx.store.as_ref(), &self.ctx.namespace, &self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{policy_owner, FakeCluster};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn policy(with_toolkit: bool) -> RBLNClusterPolicySpec {
        let mut value = serde_json::json!({
            "draKubeletPlugin": { "enabled": true, "healthcheckPort": 51515 }
        });
        if with_toolkit {
            value["containerToolkit"] = serde_json::json!({});
        }
        serde_json::from_value(value).unwrap()
    }

    fn plugin(cluster: &Arc<FakeCluster>, spec: &RBLNClusterPolicySpec) -> DraKubeletPlugin {
        DraKubeletPlugin::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), spec)
    }

    #[tokio::test]
    async fn test_requires_container_toolkit() {
        let cluster = Arc::new(FakeCluster::default());
        let err = plugin(&cluster, &policy(false)).converge(&policy_owner()).await.unwrap_err();
        assert_matches!(
            err,
            Error::ComponentPatch { source, .. } if matches!(*source, Error::Configuration(_))
        );
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_picks_newest_served_device_class() {
        let cluster = Arc::new(
            FakeCluster::default().serving(&[
                ("resource.k8s.io/v1beta2", "DeviceClass"),
                ("resource.k8s.io/v1beta1", "DeviceClass"),
                ("resource.k8s.io/v1alpha2", "ResourceClass"),
            ]),
        );
        plugin(&cluster, &policy(true)).converge(&policy_owner()).await.unwrap();

        assert!(cluster.contains(&device_class_ref("v1beta2", "npu.rebellions.ai")));
        assert!(!cluster.contains(&device_class_ref("v1beta1", "npu.rebellions.ai")));
        assert!(!cluster.contains(&resource_class_ref("npu.rebellions.ai")));

        let class = cluster.object(&device_class_ref("v1beta2", "npu.rebellions.ai")).unwrap();
        assert_eq!(
            class["spec"]["selectors"][0]["cel"]["expression"],
            "device.driver == \"npu.rebellions.ai\""
        );
        assert_eq!(class["spec"]["extendedResourceName"], "rebellions.ai/npu");
    }

    #[tokio::test]
    async fn test_falls_back_to_resource_class() {
        let cluster = Arc::new(FakeCluster::default().serving(&[("resource.k8s.io/v1alpha2", "ResourceClass")]));
        plugin(&cluster, &policy(true)).converge(&policy_owner()).await.unwrap();

        let class = cluster.object(&resource_class_ref("npu.rebellions.ai")).unwrap();
        assert_eq!(class["driverName"], "npu.rebellions.ai");
        assert!(cluster.daemonset("rbln-system", "rbln-dra-kubelet-plugin").is_some());
    }

    #[tokio::test]
    async fn test_healthcheck_adds_liveness_probe() {
        let cluster = Arc::new(FakeCluster::default());
        plugin(&cluster, &policy(true)).converge(&policy_owner()).await.unwrap();

        let ds = cluster.daemonset("rbln-system", "rbln-dra-kubelet-plugin").unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.node_selector.unwrap().get("rebellions.ai/npu.deploy.device-plugin").map(String::as_str),
            Some("true")
        );
        let container = &pod.containers[0];
        let probe = container.liveness_probe.as_ref().unwrap();
        assert_eq!(probe.grpc.as_ref().unwrap().port, 51515);
        assert!(container.env.as_ref().unwrap().iter().any(|e| e.name == "HEALTHCHECK_PORT"));
    }

    #[tokio::test]
    async fn test_tear_down_tolerates_unserved_apis() {
        let cluster = Arc::new(FakeCluster::default().serving(&[("resource.k8s.io/v1", "DeviceClass")]));
        let owner = policy_owner();
        plugin(&cluster, &policy(true)).converge(&owner).await.unwrap();
        assert!(cluster.contains(&device_class_ref("v1", "npu.rebellions.ai")));

        plugin(&cluster, &RBLNClusterPolicySpec::default()).tear_down(&owner).await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_tear_down_removes_custom_class_of_disabled_block() {
        let cluster = Arc::new(FakeCluster::default());
        let owner = policy_owner();
        let enabled: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({
            "containerToolkit": {},
            "draKubeletPlugin": { "enabled": true, "driverName": "custom.npu.example" }
        }))
        .unwrap();
        plugin(&cluster, &enabled).converge(&owner).await.unwrap();
        assert!(cluster.contains(&device_class_ref("v1", "custom.npu.example")));

        let disabled: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({
            "containerToolkit": {},
            "draKubeletPlugin": { "enabled": false, "driverName": "custom.npu.example" }
        }))
        .unwrap();
        let patcher = plugin(&cluster, &disabled);
        assert!(!patcher.is_enabled());
        patcher.tear_down(&owner).await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }
}
