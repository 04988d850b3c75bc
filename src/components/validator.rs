//! Operator validator
//!
//! Runs the driver and toolkit validations as init containers. Each one
//! leaves a `*-ready` marker under the validations directory that other
//! components wait for; the main container only keeps the pod alive and
//! removes the markers when it stops.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::warn;

use super::builders::{self, DaemonSetBuilder, VALIDATIONS_PATH, VALIDATIONS_VOLUME};
use super::container_toolkit::{CDI_ROOT, CDI_ROOT_VOLUME};
use super::{apply_objects, delete_objects, readiness, ComponentContext, OPERATOR_VALIDATOR};
use crate::crd::{ComponentSpec, Condition, RBLNClusterPolicySpec, ValidatorSpec};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::Result;

pub const VALIDATOR_COMMAND: &str = "rbln-validator";
pub const HOST_ROOT_VOLUME: &str = "host-root";
pub const DRIVER_INSTALL_DIR: &str = "/run/rbln/driver";
pub const DRIVER_INSTALL_VOLUME: &str = "driver-install-dir";

fn operator_namespace_env() -> EnvVar {
    builders::env_field("OPERATOR_NAMESPACE", "metadata.namespace")
}

fn driver_step(spec: &ValidatorSpec, env: Vec<EnvVar>) -> Container {
    let (image, pull_policy) = builders::component_image(&spec.pod);
    let mut args = vec!["driver".to_string(), "--with-wait".to_string()];
    args.extend(spec.args.iter().cloned());
    Container {
        name: "driver-validation".to_string(),
        image: Some(image),
        image_pull_policy: Some(pull_policy),
        command: builders::strings(&[VALIDATOR_COMMAND]),
        args: Some(args),
        env: Some(env),
        security_context: builders::privileged(),
        volume_mounts: Some(vec![
            VolumeMount {
                read_only: Some(true),
                ..builders::propagated_mount(HOST_ROOT_VOLUME, "/host", "HostToContainer")
            },
            builders::propagated_mount(DRIVER_INSTALL_VOLUME, DRIVER_INSTALL_DIR, "HostToContainer"),
            builders::propagated_mount(VALIDATIONS_VOLUME, VALIDATIONS_PATH, "Bidirectional"),
        ]),
        ..Default::default()
    }
}

/// Driver validation init container used by components that need the driver
pub fn driver_validation(spec: &ValidatorSpec) -> Container {
    let env = builders::merge_env(&spec.env, &[&[operator_namespace_env()], &spec.driver.env]);
    driver_step(spec, env)
}

pub struct Validator {
    ctx: ComponentContext,
    name: String,
    spec: Option<ValidatorSpec>,
}

impl Validator {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let spec = policy
            .validator
            .as_ref()
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self {
            name: ctx.component_name(OPERATOR_VALIDATOR),
            ctx,
            spec,
        }
    }

    fn base_env(spec: &ValidatorSpec) -> Vec<EnvVar> {
        let tmpdir = [builders::env_value("TMPDIR", VALIDATIONS_PATH)];
        builders::merge_env(&tmpdir, &[&spec.env, &[operator_namespace_env()]])
    }

    fn toolkit_step(spec: &ValidatorSpec, base_env: &[EnvVar]) -> Container {
        let (image, pull_policy) = builders::component_image(&spec.pod);
        let mut args = vec!["toolkit".to_string()];
        args.extend(spec.args.iter().cloned());
        Container {
            name: "toolkit-validation".to_string(),
            image: Some(image),
            image_pull_policy: Some(pull_policy),
            command: builders::strings(&[VALIDATOR_COMMAND]),
            args: Some(args),
            env: Some(builders::merge_env(base_env, &[&spec.toolkit.env])),
            security_context: builders::privileged(),
            volume_mounts: Some(vec![
                builders::propagated_mount(VALIDATIONS_VOLUME, VALIDATIONS_PATH, "Bidirectional"),
                builders::mount(CDI_ROOT_VOLUME, CDI_ROOT),
            ]),
            ..Default::default()
        }
    }

    fn desired_objects(&self, spec: &ValidatorSpec, owner: &OwnerReference) -> Vec<ManagedObject> {
        let namespace = &self.ctx.namespace;
        let pod = &spec.pod;

        let mut rules = vec![
            builders::rule(&[""], &["pods"], &["*"]),
            builders::rule(&["apps"], &["daemonsets"], &["get", "list", "watch"]),
        ];
        if self.ctx.is_openshift() {
            rules.push(builders::scc_rule());
        }
        let mut objects = vec![
            builders::service_account(&self.name, namespace, owner),
            builders::role(&self.name, namespace, rules, owner),
            builders::role_binding(&self.name, namespace, owner),
            builders::cluster_role(
                &self.name,
                vec![builders::rule(&[""], &["nodes"], &["get", "list", "watch"])],
                owner,
            ),
            builders::cluster_role_binding(&self.name, &self.name, &self.name, namespace, owner),
        ];

        let base_env = Self::base_env(spec);
        let driver_env = builders::merge_env(&base_env, &[&spec.driver.env]);
        let container = Container {
            command: builders::strings(&["sh", "-c"]),
            args: Some(vec![
                "echo all validations are successful; while true; do sleep 86400; done".to_string(),
            ]),
            lifecycle: builders::pre_stop(&["sh", "-c", &format!("rm -f {}/*-ready", VALIDATIONS_PATH)]),
            security_context: builders::privileged(),
            volume_mounts: Some(vec![builders::propagated_mount(
                VALIDATIONS_VOLUME,
                VALIDATIONS_PATH,
                "Bidirectional",
            )]),
            ..builders::component_container(&self.name, pod)
        };

        let pod_spec = PodSpec {
            init_containers: Some(vec![driver_step(spec, driver_env), Self::toolkit_step(spec, &base_env)]),
            containers: vec![container],
            volumes: Some(vec![
                builders::validations_volume(),
                builders::host_path_volume(DRIVER_INSTALL_VOLUME, DRIVER_INSTALL_DIR, Some("DirectoryOrCreate")),
                builders::host_path_volume(HOST_ROOT_VOLUME, "/", Some("Directory")),
                builders::host_path_volume(CDI_ROOT_VOLUME, CDI_ROOT, Some("DirectoryOrCreate")),
            ]),
            ..builders::component_pod_spec(pod, &self.name, builders::deploy_selector(OPERATOR_VALIDATOR))
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
        vec![
            self.ctx.namespaced(ObjectKind::DaemonSet, self.name.clone()),
            ObjectRef::cluster(ObjectKind::ClusterRoleBinding, self.name.clone()),
            ObjectRef::cluster(ObjectKind::ClusterRole, self.name.clone()),
            self.ctx.namespaced(ObjectKind::RoleBinding, self.name.clone()),
            self.ctx.namespaced(ObjectKind::Role, self.name.clone()),
            self.ctx.namespaced(ObjectKind::ServiceAccount, self.name.clone()),
        ]
    }
}

#[async_trait]
impl ComponentPatcher for Validator {
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
        warn!(component = %self.name, "Validator is not configured, removing its resources");
        delete_objects(self.ctx.store.as_ref(), &self.name, &self.owned_refs()).await
    }

    async fn readiness_report(&self, _owner: &OwnerReference) -> Vec<Condition> {
        readiness::daemonset_report(self.ctx.store.as_ref(), &self.ctx.namespace, &self.name).await
    }
}
