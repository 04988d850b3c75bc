//! RBLN daemon
//!
//! Node-local gRPC daemon on port 50051. The metrics exporter and feature
//! discovery reach it through the host IP, other consumers through the
//! node-local Service.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::warn;

use super::builders::{self, DaemonSetBuilder};
use super::{apply_objects, delete_objects, readiness, ComponentContext, RBLN_DAEMON};
use crate::crd::{ComponentSpec, Condition, RBLNClusterPolicySpec, RblnDaemonSpec};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::Result;

pub const DAEMON_PORT: i32 = 50051;
const DAEMON_BINARY: &str = "/opt/rebellions/bin/rbln_daemon";

pub struct RblnDaemon {
    ctx: ComponentContext,
    spec: Option<RblnDaemonSpec>,
}

impl RblnDaemon {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let spec = policy
            .rbln_daemon
            .as_ref()
            .filter(|spec| spec.is_enabled())
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self { ctx, spec }
    }

    fn host_port(spec: &RblnDaemonSpec) -> i32 {
        if spec.host_port > 0 {
            spec.host_port
        } else {
            DAEMON_PORT
        }
    }

    fn desired_objects(&self, spec: &RblnDaemonSpec, owner: &OwnerReference) -> Vec<ManagedObject> {
        let namespace = &self.ctx.namespace;
        let pod = &spec.pod;
        let mut objects = self.ctx.service_account_objects(RBLN_DAEMON, owner);

        let container = Container {
            command: builders::strings(&[DAEMON_BINARY]),
            args: Some(spec.args.clone()).filter(|args| !args.is_empty()),
            env: Some(spec.env.clone()).filter(|env| !env.is_empty()),
            ports: Some(vec![ContainerPort {
                name: Some(RBLN_DAEMON.to_string()),
                container_port: DAEMON_PORT,
                host_port: Some(Self::host_port(spec)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            security_context: builders::privileged(),
            volume_mounts: Some(vec![
                builders::mount("host-var-run", "/var/run"),
                builders::read_only_mount("host-sys", "/sys"),
                builders::mount("host-debug", "/sys/kernel/debug"),
                builders::mount("host-log-rebellions", "/var/log/rebellions"),
            ]),
            ..builders::component_container(RBLN_DAEMON, pod)
        };

        let (validator_image, validator_pull) = self.ctx.validator_image();
        let pod_spec = PodSpec {
            termination_grace_period_seconds: Some(0),
            init_containers: Some(vec![builders::wait_for_marker(
                "toolkit-validation",
                &validator_image,
                &validator_pull,
                "toolkit",
            )]),
            containers: vec![container],
            volumes: Some(vec![
                builders::validations_volume(),
                builders::host_path_volume("host-var-run", "/var/run", Some("Directory")),
                builders::host_path_volume("host-sys", "/sys", Some("Directory")),
                builders::host_path_volume("host-debug", "/sys/kernel/debug", Some("Directory")),
                builders::host_path_volume("host-log-rebellions", "/var/log/rebellions", Some("DirectoryOrCreate")),
            ]),
            ..builders::component_pod_spec(pod, RBLN_DAEMON, builders::deploy_selector(RBLN_DAEMON))
        };

        objects.push(
            DaemonSetBuilder::new(RBLN_DAEMON, namespace, owner)
                .selector_labels(builders::app_labels(RBLN_DAEMON))
                .labels(&pod.labels)
                .annotations(&pod.annotations)
                .pod_spec(pod_spec)
                .build(),
        );

        let mut service = builders::service(RBLN_DAEMON, namespace, RBLN_DAEMON, RBLN_DAEMON, DAEMON_PORT, owner);
        if let ManagedObject::Service(svc) = &mut service {
            if let Some(svc_spec) = svc.spec.as_mut() {
                svc_spec.internal_traffic_policy = Some("Local".to_string());
            }
        }
        objects.push(service);
        objects
    }

    fn owned_refs(&self) -> Vec<ObjectRef> {
        let mut refs = vec![
            self.ctx.namespaced(ObjectKind::Service, RBLN_DAEMON),
            self.ctx.namespaced(ObjectKind::DaemonSet, RBLN_DAEMON),
        ];
        refs.extend(self.ctx.service_account_refs(RBLN_DAEMON));
        refs
    }
}

#[async_trait]
impl ComponentPatcher for RblnDaemon {
    fn name(&self) -> &str {
        RBLN_DAEMON
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
        apply_objects(self.ctx.store.as_ref(), RBLN_DAEMON, self.desired_objects(spec, owner)).await
    }

    async fn tear_down(&self, _owner: &OwnerReference) -> Result<()> {
        warn!(component = RBLN_DAEMON, "RBLN daemon is disabled, removing its resources");
        delete_objects(self.ctx.store.as_ref(), RBLN_DAEMON, &self.owned_refs()).await
    }

    async fn readiness_report(&self, _owner: &OwnerReference) -> Vec<Condition> {
        readiness::daemonset_report(self.ctx.store.as_ref(), &self.ctx.namespace, RBLN_DAEMON).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{policy_owner, FakeCluster};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_daemon_name_is_not_prefixed() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({
            "name": "npu",
            "rblnDaemon": { "hostPort": 0, "args": ["--log-level", "debug"] }
        }))
        .unwrap();
        let patcher = RblnDaemon::new(ComponentContext::new(cluster.clone(), "rbln-system", "npu"), &spec);
        assert_eq!(patcher.name(), "rbln-daemon");
        patcher.converge(&policy_owner()).await.unwrap();

        let ds = cluster.daemonset("rbln-system", "rbln-daemon").unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let port = &pod.containers[0].ports.as_ref().unwrap()[0];
        assert_eq!(port.host_port, Some(50051));
        assert_eq!(pod.init_containers.unwrap()[0].name, "toolkit-validation");
        assert_eq!(pod.containers[0].args.as_ref().unwrap().len(), 2);

        let svc = cluster
            .object(&ObjectRef::namespaced(ObjectKind::Service, "rbln-daemon", "rbln-system"))
            .unwrap();
        assert_eq!(svc["spec"]["internalTrafficPolicy"], "Local");
    }

    #[tokio::test]
    async fn test_custom_host_port() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec =
            serde_json::from_value(serde_json::json!({ "rblnDaemon": { "hostPort": 50052 } })).unwrap();
        let patcher = RblnDaemon::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), &spec);
        patcher.converge(&policy_owner()).await.unwrap();

        let ds = cluster.daemonset("rbln-system", "rbln-daemon").unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let port = &pod.containers[0].ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 50051);
        assert_eq!(port.host_port, Some(50052));

        patcher.tear_down(&policy_owner()).await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }
}
