//! NPU feature discovery
//!
//! Writes NPU feature files into the NFD `features.d` directory so that node
//! feature discovery publishes them as node labels.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::warn;

use super::builders::{self, DaemonSetBuilder};
use super::{apply_objects, delete_objects, readiness, ComponentContext, NPU_FEATURE_DISCOVERY};
use crate::crd::{ComponentSpec, Condition, NpuFeatureDiscoverySpec, RBLNClusterPolicySpec};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::Result;

const FEATURES_DIR: &str = "/etc/kubernetes/node-feature-discovery/features.d";

pub struct FeatureDiscovery {
    ctx: ComponentContext,
    name: String,
    spec: Option<NpuFeatureDiscoverySpec>,
}

impl FeatureDiscovery {
    pub fn new(ctx: ComponentContext, policy: &RBLNClusterPolicySpec) -> Self {
        let spec = policy
            .npu_feature_discovery
            .as_ref()
            .filter(|spec| spec.is_enabled())
            .map(|spec| spec.with_defaults(policy.daemonsets.as_ref()));
        Self {
            name: ctx.component_name(NPU_FEATURE_DISCOVERY),
            ctx,
            spec,
        }
    }

    fn desired_objects(&self, spec: &NpuFeatureDiscoverySpec, owner: &OwnerReference) -> Vec<ManagedObject> {
        let pod = &spec.pod;
        let mut objects = self.ctx.service_account_objects(&self.name, owner);

        let container = Container {
            env: Some(vec![builders::env_field("NODE_IP", "status.hostIP")]),
            args: builders::strings(&["--rbln-daemon-url", "http://$(NODE_IP):50051"]),
            volume_mounts: Some(vec![builders::mount("features-dir", FEATURES_DIR)]),
            security_context: builders::privileged(),
            ..builders::component_container(&self.name, pod)
        };

        let pod_spec = PodSpec {
            termination_grace_period_seconds: Some(0),
            containers: vec![container],
            volumes: Some(vec![builders::host_path_volume("features-dir", FEATURES_DIR, None)]),
            ..builders::component_pod_spec(pod, &self.name, builders::deploy_selector(NPU_FEATURE_DISCOVERY))
        };

        objects.push(
            DaemonSetBuilder::new(&self.name, &self.ctx.namespace, owner)
                .selector_labels(builders::app_labels(&self.name))
                .labels(&pod.labels)
                .annotations(&pod.annotations)
                .pod_spec(pod_spec)
                .build(),
        );
        objects
    }
}

#[async_trait]
impl ComponentPatcher for FeatureDiscovery {
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
        warn!(component = %self.name, "NPU feature discovery is disabled, removing its resources");
        let mut refs = vec![self.ctx.namespaced(ObjectKind::DaemonSet, self.name.clone())];
        refs.extend(self.ctx.service_account_refs(&self.name));
        delete_objects(self.ctx.store.as_ref(), &self.name, &refs).await
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
    async fn test_daemonset_mounts_features_dir() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({
            "daemonsets": { "labels": { "team": "npu" } },
            "npuFeatureDiscovery": {}
        }))
        .unwrap();
        let patcher = FeatureDiscovery::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), &spec);
        patcher.converge(&policy_owner()).await.unwrap();

        let ds = cluster.daemonset("rbln-system", "rbln-npu-feature-discovery").unwrap();
        assert_eq!(ds.metadata.labels.as_ref().unwrap()["team"], "npu");
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("rbln-npu-feature-discovery"));
        assert_eq!(pod.containers[0].volume_mounts.as_ref().unwrap()[0].mount_path, FEATURES_DIR);
        assert_eq!(pod.termination_grace_period_seconds, Some(0));
    }

    #[tokio::test]
    async fn test_second_converge_is_unchanged() {
        let cluster = Arc::new(FakeCluster::default());
        let spec: RBLNClusterPolicySpec =
            serde_json::from_value(serde_json::json!({ "npuFeatureDiscovery": {} })).unwrap();
        let patcher = FeatureDiscovery::new(ComponentContext::new(cluster.clone(), "rbln-system", "rbln"), &spec);
        patcher.converge(&policy_owner()).await.unwrap();
        let before = cluster.refs();
        patcher.converge(&policy_owner()).await.unwrap();
        assert_eq!(cluster.refs(), before);
    }

    #[tokio::test]
    async fn test_tear_down_removes_everything() {
        for openshift in [None, Some("4.16".to_string())] {
            let cluster = Arc::new(FakeCluster::default());
            let spec: RBLNClusterPolicySpec =
                serde_json::from_value(serde_json::json!({ "npuFeatureDiscovery": {} })).unwrap();
            let ctx = ComponentContext::new(cluster.clone(), "rbln-system", "rbln").with_openshift_version(openshift);
            let owner = policy_owner();
            FeatureDiscovery::new(ctx.clone(), &spec).converge(&owner).await.unwrap();
            assert!(cluster.object_count() > 0);

            FeatureDiscovery::new(ctx, &RBLNClusterPolicySpec::default())
                .tear_down(&owner)
                .await
                .unwrap();
            assert_eq!(cluster.object_count(), 0);
        }
    }
}
