//! Container toolkit
//!
//! Waits for the driver validation, then runs `rbln-ctk-daemon` which writes
//! CDI specs for the NPUs and configures the node's container runtime.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;
use tracing::warn;

use super::builders::{self, DaemonSetBuilder, VALIDATIONS_PATH, VALIDATIONS_VOLUME};
use super::validator::{driver_validation, HOST_ROOT_VOLUME, DRIVER_INSTALL_DIR, DRIVER_INSTALL_VOLUME};
use super::{apply_objects, delete_objects, readiness, ComponentContext, CONTAINER_TOOLKIT};
use crate::crd::{ComponentSpec, Condition, ContainerToolkitSpec, RBLNClusterPolicySpec};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::Result;

pub const CDI_ROOT: &str = "/var/run/cdi";
pub const CDI_ROOT_VOLUME: &str = "cdi-root";
const RUN_RBLN: &str = "/run/rbln";
const HOST_BIN: &str = "/usr/local/bin";
const HOST_BIN_MOUNT: &str = "/host/usr/local/bin";
const ENTRYPOINT_KEY: &str = "entrypoint.sh";
const ENTRYPOINT_PATH: &str = "/bin/entrypoint.sh";

const ENTRYPOINT: &str = r#"#!/bin/sh
until [ -f /run/rbln/validations/driver-ready ]; do
  echo "waiting for the driver validations to be ready..."
  sleep 5
done

set -o allexport
. /run/rbln/validations/driver-ready
set +o allexport

if command -v rbln-ctk >/dev/null 2>&1; then
  rbln-ctk info || true
  echo "rbln-ctk version: $(rbln-ctk --version 2>/dev/null || echo unknown)"
fi
echo "rbln-ctk-daemon version: $(rbln-ctk-daemon --version 2>/dev/null || echo unknown)"

echo "driver-ready contents:"
cat /run/rbln/validations/driver-ready || true

exec rbln-ctk-daemon "$@"
"#;

// =============================================================================
// Container Runtime
// =============================================================================

/// Container runtime the toolkit configures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ContainerRuntime {
    #[default]
    Containerd,
    Docker,
    Crio,
}

impl ContainerRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerRuntime::Containerd => "containerd",
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Crio => "crio",
        }
    }

    pub fn socket_path(&self) -> &'static str {
        match self {
            ContainerRuntime::Containerd => "/run/containerd/containerd.sock",
            ContainerRuntime::Docker => "/var/run/docker.sock",
            ContainerRuntime::Crio => "/var/run/crio/crio.sock",
        }
    }

    fn socket_volume(&self) -> &'static str {
        match self {
            ContainerRuntime::Containerd => "containerd-sock",
            ContainerRuntime::Docker => "docker-sock",
            ContainerRuntime::Crio => "crio-sock",
        }
    }

    /// Parse a node's `containerRuntimeVersion`, e.g. `containerd://1.7.2`
    pub fn from_runtime_version(version: &str) -> Option<Self> {
        let scheme = version.split("://").next().unwrap_or_default();
        match scheme {
            "containerd" => Some(ContainerRuntime::Containerd),
            "docker" => Some(ContainerRuntime::Docker),
            "cri-o" | "crio" => Some(ContainerRuntime::Crio),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ContainerRuntime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "containerd" => Ok(ContainerRuntime::Containerd),
            "docker" => Ok(ContainerRuntime::Docker),
            "crio" | "cri-o" => Ok(ContainerRuntime::Crio),
            other => Err(format!("unsupported container runtime: {}", other)),
        }
    }
}

// =============================================================================
// Patcher
// =============================================================================

pub struct ContainerToolkit {
    ctx: ComponentContext,
    name: String,
    spec: Option<ContainerToolkitSpec>,
}

impl ContainerToolkit {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let spec = policy
            .container_toolkit
            .as_ref()
            .filter(|spec| spec.is_enabled())
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self {
            name: ctx.component_name(CONTAINER_TOOLKIT),
            ctx,
            spec,
        }
    }

    fn entrypoint_name(&self) -> String {
        format!("{}-entrypoint", self.name)
    }

    fn toolkit_container(&self, spec: &ContainerToolkitSpec) -> Container {
        let runtime = self.ctx.container_runtime;
        let runtime_env = [
            builders::env_value("RBLN_CTK_DAEMON_RUNTIME", runtime.as_str()),
            builders::env_value("RBLN_CTK_DAEMON_SOCKET", runtime.socket_path()),
        ];
        Container {
            command: builders::strings(&[ENTRYPOINT_PATH]),
            args: Some(spec.args.clone()).filter(|args| !args.is_empty()),
            env: Some(builders::merge_env(&runtime_env, &[&spec.env])),
            security_context: builders::privileged(),
            volume_mounts: Some(vec![
                builders::mount(VALIDATIONS_VOLUME, VALIDATIONS_PATH),
                builders::mount(DRIVER_INSTALL_VOLUME, DRIVER_INSTALL_DIR),
                builders::read_only_mount(HOST_ROOT_VOLUME, "/host"),
                builders::mount(CDI_ROOT_VOLUME, CDI_ROOT),
                builders::mount("run-rbln", RUN_RBLN),
                builders::mount("host-bin", HOST_BIN_MOUNT),
                builders::sub_path_mount("entrypoint", ENTRYPOINT_PATH, ENTRYPOINT_KEY),
                builders::mount(runtime.socket_volume(), runtime.socket_path()),
            ]),
            ..builders::component_container(&self.name, &spec.pod)
        }
    }

    fn desired_objects(&self, spec: &ContainerToolkitSpec, owner: &OwnerReference) -> Vec<ManagedObject> {
        let namespace = &self.ctx.namespace;
        let pod = &spec.pod;
        let runtime = self.ctx.container_runtime;

        let mut objects = vec![builders::service_account(&self.name, namespace, owner)];
        let mut rules = vec![builders::rule(&["apps"], &["daemonsets"], &["get", "list", "watch"])];
        if self.ctx.is_openshift() {
            rules.push(builders::scc_rule());
        }
        objects.push(builders::role(&self.name, namespace, rules, owner));
        objects.push(builders::role_binding(&self.name, namespace, owner));
        objects.push(builders::config_map(
            &self.entrypoint_name(),
            namespace,
            BTreeMap::from([(ENTRYPOINT_KEY.to_string(), ENTRYPOINT.to_string())]),
            owner,
        ));

        let pod_spec = PodSpec {
            host_pid: Some(true),
            init_containers: Some(vec![driver_validation(&self.ctx.validator)]),
            containers: vec![self.toolkit_container(spec)],
            volumes: Some(vec![
                builders::validations_volume(),
                builders::host_path_volume(DRIVER_INSTALL_VOLUME, DRIVER_INSTALL_DIR, Some("DirectoryOrCreate")),
                builders::host_path_volume(HOST_ROOT_VOLUME, "/", Some("Directory")),
                builders::host_path_volume(CDI_ROOT_VOLUME, CDI_ROOT, Some("DirectoryOrCreate")),
                builders::host_path_volume("run-rbln", RUN_RBLN, Some("DirectoryOrCreate")),
                builders::host_path_volume("host-bin", HOST_BIN, Some("DirectoryOrCreate")),
                builders::config_map_volume("entrypoint", &self.entrypoint_name(), ENTRYPOINT_KEY, None, Some(0o755)),
                builders::host_path_volume(runtime.socket_volume(), runtime.socket_path(), Some("Socket")),
            ]),
            ..builders::component_pod_spec(pod, &self.name, builders::deploy_selector(CONTAINER_TOOLKIT))
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
            self.ctx.namespaced(ObjectKind::ConfigMap, self.entrypoint_name()),
            self.ctx.namespaced(ObjectKind::RoleBinding, self.name.clone()),
            self.ctx.namespaced(ObjectKind::Role, self.name.clone()),
            self.ctx.namespaced(ObjectKind::ServiceAccount, self.name.clone()),
        ]
    }
}

#[async_trait]
impl ComponentPatcher for ContainerToolkit {
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
        warn!(component = %self.name, "Container toolkit is disabled, removing its resources");
        delete_objects(self.ctx.store.as_ref(), &self.name, &self.owned_refs()).await
    }

    async fn readiness_report(&self, _owner: &OwnerReference) -> Vec<Condition> {
        readiness::daemonset_report(self.ctx.store.as_ref(), &self.ctx.namespace, &self.name).await
    }
}
