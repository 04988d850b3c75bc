//! Metrics exporter
//!
//! Scrapes NPU telemetry from the node-local daemon and serves it on 9090
//! behind a Prometheus-annotated Service.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec, SecurityContext};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;
use tracing::warn;

use super::builders::{self, DaemonSetBuilder};
use super::{apply_objects, delete_objects, readiness, ComponentContext, METRICS_EXPORTER};
use crate::crd::{ComponentSpec, Condition, MetricsExporterSpec, RBLNClusterPolicySpec};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::Result;

pub const METRICS_PORT: i32 = 9090;

pub struct MetricsExporter {
    ctx: ComponentContext,
    name: String,
    spec: Option<MetricsExporterSpec>,
}

impl MetricsExporter {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let spec = policy
            .metrics_exporter
            .as_ref()
            .filter(|spec| spec.is_enabled())
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self {
            name: ctx.component_name(METRICS_EXPORTER),
            ctx,
            spec,
        }
    }

    fn service_name(&self) -> String {
        format!("{}-service", self.name)
    }

    fn desired_objects(&self, spec: &MetricsExporterSpec, owner: &OwnerReference) -> Vec<ManagedObject> {
        let namespace = &self.ctx.namespace;
        let pod = &spec.pod;
        let mut objects = self.ctx.service_account_objects(&self.name, owner);

        let mut node_ip = builders::env_field("NODE_IP", "status.hostIP");
        if let Some(field_ref) = node_ip.value_from.as_mut().and_then(|v| v.field_ref.as_mut()) {
            field_ref.api_version = Some("v1".to_string());
        }
        let container = Container {
            env: Some(vec![
                node_ip,
                builders::env_field("NODE_NAME", "spec.nodeName"),
                builders::env_value("RBLN_METRICS_EXPORTER_RBLN_DAEMON_URL", "http://$(NODE_IP):50051"),
            ]),
            volume_mounts: Some(vec![
                builders::read_only_mount("pod-resources", "/var/lib/kubelet/pod-resources"),
                builders::read_only_mount("sysfs", "/sys"),
            ]),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                run_as_user: Some(0),
                run_as_group: Some(0),
                read_only_root_filesystem: Some(false),
                ..Default::default()
            }),
            ..builders::component_container(&self.name, pod)
        };

        let pod_spec = PodSpec {
            termination_grace_period_seconds: Some(0),
            containers: vec![container],
            volumes: Some(vec![
                builders::host_path_volume("pod-resources", "/var/lib/kubelet/pod-resources", Some("Directory")),
                builders::host_path_volume("sysfs", "/sys", Some("Directory")),
            ]),
            ..builders::component_pod_spec(pod, &self.name, builders::deploy_selector(METRICS_EXPORTER))
        };

        objects.push(
            DaemonSetBuilder::new(&self.name, namespace, owner)
                .selector_labels(builders::app_labels(&self.name))
                .labels(&pod.labels)
                .annotations(&pod.annotations)
                .pod_spec(pod_spec)
                .build(),
        );

        let mut service = builders::service(&self.service_name(), namespace, &self.name, "http", METRICS_PORT, owner);
        if let ManagedObject::Service(svc) = &mut service {
            svc.metadata.annotations = Some(BTreeMap::from([
                ("prometheus.io/scrape".to_string(), "true".to_string()),
                ("prometheus.io/path".to_string(), "/metrics".to_string()),
                ("prometheus.io/port".to_string(), METRICS_PORT.to_string()),
            ]));
        }
        objects.push(service);
        objects
    }

    fn owned_refs(&self) -> Vec<ObjectRef> {
        let mut refs = vec![
            self.ctx.namespaced(ObjectKind::Service, self.service_name()),
            self.ctx.namespaced(ObjectKind::DaemonSet, self.name.clone()),
        ];
        refs.extend(self.ctx.service_account_refs(&self.name));
        refs
    }
}

#[async_trait]
impl ComponentPatcher for MetricsExporter {
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
        warn!(component = %self.name, "Metrics exporter is disabled, removing its resources");
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

    #[tokio::test]
    async fn test_service_is_scrapeable() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec =
            serde_json::from_value(serde_json::json!({ "metricsExporter": { "version": "1.0.0" } })).unwrap();
        let patcher = MetricsExporter::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), &spec);
        patcher.converge(&policy_owner()).await.unwrap();

        let svc = cluster
            .object(&ObjectRef::namespaced(ObjectKind::Service, "rbln-metrics-exporter-service", "rbln-system"))
            .unwrap();
        assert_eq!(svc["metadata"]["annotations"]["prometheus.io/port"], "9090");
        assert_eq!(svc["spec"]["selector"]["app"], "rbln-metrics-exporter");
        assert_eq!(svc["spec"]["ports"][0]["port"], 9090);

        let ds = cluster.daemonset("rbln-system", "rbln-metrics-exporter").unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.clone().unwrap();
        assert_eq!(env[2].value.as_deref(), Some("http://$(NODE_IP):50051"));
    }

    #[tokio::test]
    async fn test_tear_down_removes_service_first() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({ "metricsExporter": {} })).unwrap();
        let patcher = MetricsExporter::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), &spec);
        patcher.converge(&policy_owner()).await.unwrap();
        assert_eq!(cluster.object_count(), 3);

        assert_eq!(patcher.owned_refs()[0].kind, ObjectKind::Service);
        patcher.tear_down(&policy_owner()).await.unwrap();
        assert_eq!(cluster.object_count(), 0);
    }
}
