//! Object builders shared by the component patchers
//!
//! Every builder takes the owner reference so that the garbage collector
//! removes the objects together with their custom resource.

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, HostPathVolumeSource, KeyToPath, Lifecycle, LifecycleHandler, LocalObjectReference,
    ObjectFieldSelector, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecurityContext, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use super::image::{compose_image_reference, tagged_image};
use crate::crd::ComponentPodSpec;
use crate::domain::ManagedObject;

// =============================================================================
// Shared Paths and Labels
// =============================================================================

/// Host directory where validation marker files are written
pub const VALIDATIONS_PATH: &str = "/run/rbln/validations";
pub const VALIDATIONS_VOLUME: &str = "run-rbln-validations";

pub const DEPLOY_LABEL_PREFIX: &str = "rebellions.ai/npu.deploy.";
pub const APP_LABEL: &str = "app";

pub const DEFAULT_CPU_REQUEST: &str = "250m";
pub const DEFAULT_MEMORY_REQUEST: &str = "40Mi";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// `rebellions.ai/npu.deploy.<component>=true`
pub fn deploy_selector(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(format!("{}{}", DEPLOY_LABEL_PREFIX, component), "true".to_string())])
}

pub fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

fn non_empty<T>(items: T) -> Option<T>
where
    T: IntoIterator + Clone,
{
    items.clone().into_iter().next().map(|_| items)
}

// =============================================================================
// Metadata and RBAC
// =============================================================================

pub fn metadata(name: &str, namespace: Option<&str>, owner: &OwnerReference) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

pub fn service_account(name: &str, namespace: &str, owner: &OwnerReference) -> ManagedObject {
    ManagedObject::ServiceAccount(ServiceAccount {
        metadata: metadata(name, Some(namespace), owner),
        ..Default::default()
    })
}

pub fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Grants use of the `privileged` SecurityContextConstraints on OpenShift
pub fn scc_rule() -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec!["security.openshift.io".to_string()]),
        resources: Some(vec!["securitycontextconstraints".to_string()]),
        resource_names: Some(vec!["privileged".to_string()]),
        verbs: vec!["use".to_string()],
        ..Default::default()
    }
}

pub fn role(name: &str, namespace: &str, rules: Vec<PolicyRule>, owner: &OwnerReference) -> ManagedObject {
    ManagedObject::Role(Role {
        metadata: metadata(name, Some(namespace), owner),
        rules: Some(rules),
    })
}

fn service_account_subject(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Binds Role `name` to ServiceAccount `name`
pub fn role_binding(name: &str, namespace: &str, owner: &OwnerReference) -> ManagedObject {
    ManagedObject::RoleBinding(RoleBinding {
        metadata: metadata(name, Some(namespace), owner),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![service_account_subject(name, namespace)]),
    })
}

pub fn cluster_role(name: &str, rules: Vec<PolicyRule>, owner: &OwnerReference) -> ManagedObject {
    ManagedObject::ClusterRole(ClusterRole {
        metadata: metadata(name, None, owner),
        rules: Some(rules),
        ..Default::default()
    })
}

/// Binds ClusterRole `role` to ServiceAccount `account` in `namespace`
pub fn cluster_role_binding(
    name: &str,
    role: &str,
    account: &str,
    namespace: &str,
    owner: &OwnerReference,
) -> ManagedObject {
    ManagedObject::ClusterRoleBinding(ClusterRoleBinding {
        metadata: metadata(name, None, owner),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![service_account_subject(account, namespace)]),
    })
}

pub fn config_map(
    name: &str,
    namespace: &str,
    data: BTreeMap<String, String>,
    owner: &OwnerReference,
) -> ManagedObject {
    ManagedObject::ConfigMap(ConfigMap {
        metadata: metadata(name, Some(namespace), owner),
        data: Some(data),
        ..Default::default()
    })
}

/// ClusterIP service selecting `app={name}`
pub fn service(
    name: &str,
    namespace: &str,
    app: &str,
    port_name: &str,
    port: i32,
    owner: &OwnerReference,
) -> ManagedObject {
    let mut meta = metadata(name, Some(namespace), owner);
    meta.labels = Some(app_labels(app));
    ManagedObject::Service(Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            selector: Some(app_labels(app)),
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                port,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

// =============================================================================
// Containers
// =============================================================================

/// Resource requirements with cpu and memory requests filled in when unset.
/// Limits are left exactly as given.
pub fn requests_with_defaults(
    resources: Option<&ResourceRequirements>,
    cpu: &str,
    memory: &str,
) -> ResourceRequirements {
    let mut resources = resources.cloned().unwrap_or_default();
    let requests = resources.requests.get_or_insert_with(BTreeMap::new);
    requests
        .entry("cpu".to_string())
        .or_insert_with(|| Quantity(cpu.to_string()));
    requests
        .entry("memory".to_string())
        .or_insert_with(|| Quantity(memory.to_string()));
    resources
}

/// Image and pull policy of a component's main container
pub fn component_image(pod: &ComponentPodSpec) -> (String, String) {
    let reference = compose_image_reference(
        pod.registry.as_deref().unwrap_or_default(),
        pod.image.as_deref().unwrap_or_default(),
    );
    tagged_image(&reference, pod.version.as_deref(), pod.pull_policy())
}

/// Main container skeleton: name, image, pull policy and default requests
pub fn component_container(name: &str, pod: &ComponentPodSpec) -> Container {
    let (image, pull_policy) = component_image(pod);
    Container {
        name: name.to_string(),
        image: Some(image),
        image_pull_policy: Some(pull_policy),
        resources: Some(requests_with_defaults(
            pod.resources.as_ref(),
            DEFAULT_CPU_REQUEST,
            DEFAULT_MEMORY_REQUEST,
        )),
        ..Default::default()
    }
}

pub fn privileged() -> Option<SecurityContext> {
    Some(SecurityContext {
        privileged: Some(true),
        run_as_user: Some(0),
        ..Default::default()
    })
}

/// preStop hook running `command`
pub fn pre_stop(command: &[&str]) -> Option<Lifecycle> {
    Some(Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: strings(command),
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn strings(items: &[&str]) -> Option<Vec<String>> {
    Some(items.iter().map(|s| s.to_string()).collect())
}

pub fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

pub fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Merge env lists in order; a later entry replaces an earlier one in place
pub fn merge_env(base: &[EnvVar], additions: &[&[EnvVar]]) -> Vec<EnvVar> {
    let mut merged = base.to_vec();
    for env in additions.iter().flat_map(|list| list.iter()) {
        match merged.iter_mut().find(|existing| existing.name == env.name) {
            Some(existing) => *existing = env.clone(),
            None => merged.push(env.clone()),
        }
    }
    merged
}

// =============================================================================
// Volumes
// =============================================================================

pub fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        read_only: Some(true),
        ..mount(name, path)
    }
}

pub fn propagated_mount(name: &str, path: &str, propagation: &str) -> VolumeMount {
    VolumeMount {
        mount_propagation: Some(propagation.to_string()),
        ..mount(name, path)
    }
}

pub fn sub_path_mount(name: &str, path: &str, sub_path: &str) -> VolumeMount {
    VolumeMount {
        sub_path: Some(sub_path.to_string()),
        read_only: Some(true),
        ..mount(name, path)
    }
}

pub fn host_path_volume(name: &str, path: &str, kind: Option<&str>) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: kind.map(str::to_string),
        }),
        ..Default::default()
    }
}

pub fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Volume projecting `key` of ConfigMap `config_map`
pub fn config_map_volume(
    name: &str,
    config_map: &str,
    key: &str,
    item_mode: Option<i32>,
    default_mode: Option<i32>,
) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(config_map.to_string()),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: key.to_string(),
                mode: item_mode,
            }]),
            default_mode,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Host path volume for the validation marker directory
pub fn validations_volume() -> Volume {
    host_path_volume(VALIDATIONS_VOLUME, VALIDATIONS_PATH, Some("DirectoryOrCreate"))
}

/// Init container blocking until `{marker}-ready` exists
pub fn wait_for_marker(name: &str, image: &str, pull_policy: &str, marker: &str) -> Container {
    let script = format!(
        "until [ -f {dir}/{marker}-ready ]; do echo waiting for {marker} validation; sleep 5; done",
        dir = VALIDATIONS_PATH,
        marker = marker
    );
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(pull_policy.to_string()),
        command: strings(&["sh", "-c"]),
        args: Some(vec![script]),
        security_context: privileged(),
        volume_mounts: Some(vec![propagated_mount(
            VALIDATIONS_VOLUME,
            VALIDATIONS_PATH,
            "HostToContainer",
        )]),
        ..Default::default()
    }
}

// =============================================================================
// Pods and DaemonSets
// =============================================================================

/// Pod spec skeleton with the component's scheduling settings applied
pub fn component_pod_spec(
    pod: &ComponentPodSpec,
    service_account: &str,
    node_selector: BTreeMap<String, String>,
) -> PodSpec {
    PodSpec {
        service_account_name: Some(service_account.to_string()),
        node_selector: Some(node_selector),
        affinity: pod.affinity.clone(),
        tolerations: non_empty(pod.tolerations.clone()),
        image_pull_secrets: image_pull_secrets(&pod.image_pull_secrets),
        priority_class_name: pod.priority_class_name.clone().filter(|p| !p.is_empty()),
        ..Default::default()
    }
}

pub fn image_pull_secrets(secrets: &[String]) -> Option<Vec<LocalObjectReference>> {
    non_empty(
        secrets
            .iter()
            .map(|name| LocalObjectReference {
                name: Some(name.clone()),
            })
            .collect::<Vec<_>>(),
    )
}

/// Builder for the DaemonSet every component ends up with
pub struct DaemonSetBuilder {
    ds: DaemonSet,
}

impl DaemonSetBuilder {
    pub fn new(name: &str, namespace: &str, owner: &OwnerReference) -> Self {
        Self {
            ds: DaemonSet {
                metadata: metadata(name, Some(namespace), owner),
                spec: Some(DaemonSetSpec {
                    selector: LabelSelector::default(),
                    template: PodTemplateSpec::default(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    fn spec_mut(&mut self) -> &mut DaemonSetSpec {
        self.ds.spec.get_or_insert_with(Default::default)
    }

    /// Selector labels land on the object, the selector and the pod template
    pub fn selector_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.ds.metadata.labels = Some(labels.clone());
        let spec = self.spec_mut();
        spec.selector.match_labels = Some(labels.clone());
        spec.template
            .metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels = Some(labels);
        self
    }

    /// Extra object labels; selector labels win on conflict
    pub fn labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        let current = self.ds.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            current.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    pub fn annotations(mut self, annotations: &BTreeMap<String, String>) -> Self {
        self.ds.metadata.annotations = non_empty(annotations.clone());
        self
    }

    pub fn pod_spec(mut self, pod_spec: PodSpec) -> Self {
        self.spec_mut().template.spec = Some(pod_spec);
        self
    }

    pub fn rolling_update(mut self) -> Self {
        self.spec_mut().update_strategy = Some(DaemonSetUpdateStrategy {
            type_: Some("RollingUpdate".to_string()),
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> ManagedObject {
        ManagedObject::DaemonSet(self.ds)
    }
}
