//! Kubernetes-backed [`ClusterStore`]
//!
//! Desired objects are written with server-side apply under a single field
//! manager. The live object is read first so the outcome can be reported as
//! created, updated or unchanged. Dynamic kinds are resolved through API
//! discovery on every call; a group, version or kind the server does not
//! serve surfaces as [`Error::ApiNotServed`].

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::discovery::{self, Scope};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, trace};

use crate::crd::{RBLNClusterPolicy, RBLNClusterPolicyStatus, RBLNDriver, RBLNDriverStatus};
use crate::domain::{ClusterStore, ManagedObject, ObjectKind, ObjectRef, PatchOutcome};
use crate::error::{Error, Result};

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "rbln-npu-operator";

/// `a=b,c=d` label selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Split `group/version` (or a bare core `version`) into a GVK
pub fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

fn object_name<K: Resource>(object: &K) -> Result<String> {
    object
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::Internal("desired object has no name".to_string()))
}

fn outcome<K: Resource>(existing: Option<&K>, patched: &K) -> PatchOutcome {
    match existing {
        None => PatchOutcome::Created,
        Some(live) if live.meta().resource_version == patched.meta().resource_version => PatchOutcome::Unchanged,
        Some(_) => PatchOutcome::Updated,
    }
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn namespaced_api<K>(&self, namespace: Option<&str>) -> Result<Api<K>>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = namespace
            .ok_or_else(|| Error::Configuration(format!("{} requires a namespace", K::kind(&Default::default()))))?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    async fn apply<K>(&self, api: Api<K>, object: &K) -> Result<PatchOutcome>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let name = object_name(object)?;
        let existing = api.get_opt(&name).await?;
        let patched = api
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(object))
            .await?;
        Ok(outcome(existing.as_ref(), &patched))
    }

    async fn remove<K>(&self, api: Api<K>, name: &str) -> Result<bool>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn dynamic_api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let gvk = parse_gvk(api_version, kind);
        let not_served = || Error::ApiNotServed {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        };
        let (resource, caps) = match discovery::pinned_kind(&self.client, &gvk).await {
            Ok(found) => found,
            Err(e) if is_not_found(&e) => return Err(not_served()),
            Err(kube::Error::Discovery(e)) => {
                trace!(api_version, kind, error = %e, "Discovery did not find kind");
                return Err(not_served());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        })
    }

    async fn apply_dynamic(&self, object: DynamicObject) -> Result<PatchOutcome> {
        let types = object
            .types
            .clone()
            .ok_or_else(|| Error::Internal("dynamic object has no apiVersion/kind".to_string()))?;
        let api = self
            .dynamic_api(&types.api_version, &types.kind, object.metadata.namespace.as_deref())
            .await?;
        let name = object.name_any();
        let existing = api.get_opt(&name).await?;
        let patched = api
            .patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&object))
            .await?;
        Ok(outcome(existing.as_ref(), &patched))
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn create_or_patch(&self, object: ManagedObject) -> Result<PatchOutcome> {
        let target = object.object_ref();
        let ns = target.namespace.as_deref();
        let outcome = match &object {
            ManagedObject::ServiceAccount(o) => self.apply(self.namespaced_api::<ServiceAccount>(ns)?, o).await,
            ManagedObject::Role(o) => self.apply(self.namespaced_api::<Role>(ns)?, o).await,
            ManagedObject::RoleBinding(o) => self.apply(self.namespaced_api::<RoleBinding>(ns)?, o).await,
            ManagedObject::ClusterRole(o) => self.apply(Api::<ClusterRole>::all(self.client.clone()), o).await,
            ManagedObject::ClusterRoleBinding(o) => {
                self.apply(Api::<ClusterRoleBinding>::all(self.client.clone()), o).await
            }
            ManagedObject::ConfigMap(o) => self.apply(self.namespaced_api::<ConfigMap>(ns)?, o).await,
            ManagedObject::DaemonSet(o) => self.apply(self.namespaced_api::<DaemonSet>(ns)?, o).await,
            ManagedObject::Service(o) => self.apply(self.namespaced_api::<Service>(ns)?, o).await,
            ManagedObject::Dynamic(o) => self.apply_dynamic(o.clone()).await,
        }?;
        debug!(object = %target, %outcome, "Applied object");
        Ok(outcome)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<bool> {
        let ns = target.namespace.as_deref();
        let name = target.name.as_str();
        match &target.kind {
            ObjectKind::ServiceAccount => self.remove(self.namespaced_api::<ServiceAccount>(ns)?, name).await,
            ObjectKind::Role => self.remove(self.namespaced_api::<Role>(ns)?, name).await,
            ObjectKind::RoleBinding => self.remove(self.namespaced_api::<RoleBinding>(ns)?, name).await,
            ObjectKind::ClusterRole => self.remove(Api::<ClusterRole>::all(self.client.clone()), name).await,
            ObjectKind::ClusterRoleBinding => {
                self.remove(Api::<ClusterRoleBinding>::all(self.client.clone()), name).await
            }
            ObjectKind::ConfigMap => self.remove(self.namespaced_api::<ConfigMap>(ns)?, name).await,
            ObjectKind::DaemonSet => self.remove(self.namespaced_api::<DaemonSet>(ns)?, name).await,
            ObjectKind::Service => self.remove(self.namespaced_api::<Service>(ns)?, name).await,
            ObjectKind::Dynamic { api_version, kind } => {
                let api = self.dynamic_api(api_version, kind, ns).await?;
                self.remove(api, name).await
            }
        }
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_daemonsets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn list_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn get_cluster_policy(&self, name: &str) -> Result<Option<RBLNClusterPolicy>> {
        let api: Api<RBLNClusterPolicy> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_cluster_policies(&self) -> Result<Vec<RBLNClusterPolicy>> {
        let api: Api<RBLNClusterPolicy> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_cluster_policy_status(
        &self,
        name: &str,
        status: &RBLNClusterPolicyStatus,
    ) -> Result<()> {
        let api: Api<RBLNClusterPolicy> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_driver(&self, name: &str) -> Result<Option<RBLNDriver>> {
        let api: Api<RBLNDriver> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_drivers(&self) -> Result<Vec<RBLNDriver>> {
        let api: Api<RBLNDriver> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_driver_status(&self, name: &str, status: &RBLNDriverStatus) -> Result<()> {
        let api: Api<RBLNDriver> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector() {
        let labels = BTreeMap::from([
            ("rebellions.ai/npu.deploy.driver".to_string(), "true".to_string()),
            ("app.kubernetes.io/component".to_string(), "rbln-driver".to_string()),
        ]);
        assert_eq!(
            label_selector(&labels),
            "app.kubernetes.io/component=rbln-driver,rebellions.ai/npu.deploy.driver=true"
        );
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }

    #[test]
    fn test_parse_gvk() {
        let gvk = parse_gvk("resource.k8s.io/v1beta2", "DeviceClass");
        assert_eq!(gvk.group, "resource.k8s.io");
        assert_eq!(gvk.version, "v1beta2");
        assert_eq!(gvk.kind, "DeviceClass");

        let core = parse_gvk("v1", "ConfigMap");
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
    }

    #[test]
    fn test_outcome_from_resource_version() {
        let mut live = ConfigMap::default();
        live.metadata.resource_version = Some("7".to_string());
        let mut patched = live.clone();
        assert_eq!(outcome(None, &patched), PatchOutcome::Created);
        assert_eq!(outcome(Some(&live), &patched), PatchOutcome::Unchanged);
        patched.metadata.resource_version = Some("8".to_string());
        assert_eq!(outcome(Some(&live), &patched), PatchOutcome::Updated);
    }
}
