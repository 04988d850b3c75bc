//! In-memory cluster used by the unit tests

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::crd::{RBLNClusterPolicy, RBLNClusterPolicySpec, RBLNClusterPolicyStatus, RBLNDriver, RBLNDriverSpec, RBLNDriverStatus};
use crate::domain::{ClusterStore, ManagedObject, ObjectKind, ObjectRef, PatchOutcome};
use crate::error::{Error, Result};

pub fn policy_owner() -> OwnerReference {
    OwnerReference {
        api_version: "rebellions.ai/v1beta1".to_string(),
        kind: "RBLNClusterPolicy".to_string(),
        name: "rbln-cluster-policy".to_string(),
        uid: "0b7a3c4e-policy".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn driver_owner() -> OwnerReference {
    OwnerReference {
        api_version: "rebellions.ai/v1alpha1".to_string(),
        kind: "RBLNDriver".to_string(),
        name: "rbln-driver".to_string(),
        uid: "5d1e9f2a-driver".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn policy(name: &str, spec: RBLNClusterPolicySpec) -> RBLNClusterPolicy {
    let mut policy = RBLNClusterPolicy::new(name, spec);
    policy.metadata.uid = Some(format!("{}-uid", name));
    policy.metadata.generation = Some(1);
    policy
}

pub fn driver(name: &str, spec: RBLNDriverSpec) -> RBLNDriver {
    let mut driver = RBLNDriver::new(name, spec);
    driver.metadata.uid = Some(format!("{}-uid", name));
    driver.metadata.generation = Some(1);
    driver
}

fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

fn to_value(object: &ManagedObject) -> Result<Value> {
    let value = match object {
        ManagedObject::ServiceAccount(o) => serde_json::to_value(o)?,
        ManagedObject::Role(o) => serde_json::to_value(o)?,
        ManagedObject::RoleBinding(o) => serde_json::to_value(o)?,
        ManagedObject::ClusterRole(o) => serde_json::to_value(o)?,
        ManagedObject::ClusterRoleBinding(o) => serde_json::to_value(o)?,
        ManagedObject::ConfigMap(o) => serde_json::to_value(o)?,
        ManagedObject::DaemonSet(o) => serde_json::to_value(o)?,
        ManagedObject::Service(o) => serde_json::to_value(o)?,
        ManagedObject::Dynamic(o) => serde_json::to_value(o)?,
    };
    Ok(value)
}

/// Fake [`ClusterStore`] keeping every object as JSON
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectRef, Value>>,
    daemonset_status: Mutex<BTreeMap<(String, String), DaemonSetStatus>>,
    nodes: Mutex<BTreeMap<String, Node>>,
    policies: Mutex<BTreeMap<String, RBLNClusterPolicy>>,
    drivers: Mutex<BTreeMap<String, RBLNDriver>>,
    /// `apiVersion/kind` of the dynamic APIs served; `None` serves all
    served: Mutex<Option<BTreeSet<String>>>,
    fail_patches_for: Mutex<BTreeSet<String>>,
    fail_policy_reads: AtomicBool,
    fail_node_lists: AtomicBool,
    updates: AtomicUsize,
    node_patches: AtomicUsize,
    policy_status_writes: AtomicUsize,
}

impl FakeCluster {
    pub fn with_nodes(self, nodes: Vec<Node>) -> Self {
        {
            let mut stored = self.nodes.lock();
            for node in nodes {
                stored.insert(node.metadata.name.clone().unwrap_or_default(), node);
            }
        }
        self
    }

    pub fn with_policy(self, policy: RBLNClusterPolicy) -> Self {
        self.policies
            .lock()
            .insert(policy.metadata.name.clone().unwrap_or_default(), policy);
        self
    }

    pub fn with_driver(self, driver: RBLNDriver) -> Self {
        self.drivers
            .lock()
            .insert(driver.metadata.name.clone().unwrap_or_default(), driver);
        self
    }

    /// Serve only the listed dynamic APIs
    pub fn serving(self, apis: &[(&str, &str)]) -> Self {
        *self.served.lock() = Some(
            apis.iter()
                .map(|(api_version, kind)| format!("{}/{}", api_version, kind))
                .collect(),
        );
        self
    }

    /// Make every create-or-patch of objects named `name` fail
    pub fn failing_patches_for(self, name: &str) -> Self {
        self.fail_patches_for.lock().insert(name.to_string());
        self
    }

    pub fn fail_policy_reads(&self, fail: bool) {
        self.fail_policy_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_node_lists(&self, fail: bool) {
        self.fail_node_lists.store(fail, Ordering::SeqCst);
    }

    /// Create-or-patch calls that changed an existing object
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn set_daemonset_status(&self, namespace: &str, name: &str, desired: i32, ready: i32, unavailable: i32) {
        self.daemonset_status.lock().insert(
            (namespace.to_string(), name.to_string()),
            DaemonSetStatus {
                desired_number_scheduled: desired,
                number_ready: ready,
                number_unavailable: Some(unavailable),
                ..Default::default()
            },
        );
    }

    pub fn remove_policy(&self, name: &str) {
        self.policies.lock().remove(name);
    }

    pub fn object(&self, target: &ObjectRef) -> Option<Value> {
        self.objects.lock().get(target).cloned()
    }

    pub fn contains(&self, target: &ObjectRef) -> bool {
        self.objects.lock().contains_key(target)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn refs(&self) -> Vec<ObjectRef> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn daemonset(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        let target = ObjectRef::namespaced(ObjectKind::DaemonSet, name, namespace);
        let value = self.object(&target)?;
        let mut ds: DaemonSet = serde_json::from_value(value).ok()?;
        ds.status = self
            .daemonset_status
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned();
        Some(ds)
    }

    pub fn node_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.nodes
            .lock()
            .get(name)
            .and_then(|n| n.metadata.labels.clone())
            .unwrap_or_default()
    }

    pub fn node_patch_count(&self) -> usize {
        self.node_patches.load(Ordering::SeqCst)
    }

    pub fn policy_status(&self, name: &str) -> Option<RBLNClusterPolicyStatus> {
        self.policies.lock().get(name).and_then(|p| p.status.clone())
    }

    pub fn policy_status_writes(&self) -> usize {
        self.policy_status_writes.load(Ordering::SeqCst)
    }

    pub fn driver_status(&self, name: &str) -> Option<RBLNDriverStatus> {
        self.drivers.lock().get(name).and_then(|d| d.status.clone())
    }

    fn check_served(&self, kind: &ObjectKind) -> Result<()> {
        let ObjectKind::Dynamic { api_version, kind } = kind else {
            return Ok(());
        };
        match &*self.served.lock() {
            Some(served) if !served.contains(&format!("{}/{}", api_version, kind)) => Err(Error::ApiNotServed {
                api_version: api_version.clone(),
                kind: kind.clone(),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterStore for FakeCluster {
    async fn create_or_patch(&self, object: ManagedObject) -> Result<PatchOutcome> {
        let target = object.object_ref();
        self.check_served(&target.kind)?;
        if self.fail_patches_for.lock().contains(&target.name) {
            return Err(Error::Internal(format!("injected failure for {}", target)));
        }

        let value = to_value(&object)?;
        let mut objects = self.objects.lock();
        let outcome = match objects.get(&target) {
            None => PatchOutcome::Created,
            Some(existing) if *existing == value => PatchOutcome::Unchanged,
            Some(_) => PatchOutcome::Updated,
        };
        if outcome == PatchOutcome::Updated {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        objects.insert(target, value);
        Ok(outcome)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<bool> {
        self.check_served(&target.kind)?;
        Ok(self.objects.lock().remove(target).is_some())
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        Ok(self.daemonset(namespace, name))
    }

    async fn list_daemonsets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>> {
        let names: Vec<String> = self
            .objects
            .lock()
            .iter()
            .filter(|(target, _)| {
                target.kind == ObjectKind::DaemonSet && target.namespace.as_deref() == Some(namespace)
            })
            .filter(|(_, value)| {
                let labels_value = value
                    .pointer("/metadata/labels")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<BTreeMap<String, String>>(v).ok());
                labels_match(labels_value.as_ref(), labels)
            })
            .map(|(target, _)| target.name.clone())
            .collect();
        Ok(names
            .iter()
            .filter_map(|name| self.daemonset(namespace, name))
            .collect())
    }

    async fn list_nodes(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        if self.fail_node_lists.load(Ordering::SeqCst) {
            return Err(Error::Internal("injected node list failure".to_string()));
        }
        Ok(self
            .nodes
            .lock()
            .values()
            .filter(|node| labels_match(node.metadata.labels.as_ref(), labels))
            .cloned()
            .collect())
    }

    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(name).ok_or_else(|| Error::ResourceNotFound {
            kind: "Node".to_string(),
            name: name.to_string(),
        })?;
        let current = node.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            match value {
                Some(value) => {
                    current.insert(key.clone(), value.clone());
                }
                None => {
                    current.remove(key);
                }
            }
        }
        self.node_patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_cluster_policy(&self, name: &str) -> Result<Option<RBLNClusterPolicy>> {
        if self.fail_policy_reads.load(Ordering::SeqCst) {
            return Err(Error::Internal("injected policy read failure".to_string()));
        }
        Ok(self.policies.lock().get(name).cloned())
    }

    async fn list_cluster_policies(&self) -> Result<Vec<RBLNClusterPolicy>> {
        Ok(self.policies.lock().values().cloned().collect())
    }

    async fn patch_cluster_policy_status(
        &self,
        name: &str,
        status: &RBLNClusterPolicyStatus,
    ) -> Result<()> {
        let mut policies = self.policies.lock();
        let policy = policies.get_mut(name).ok_or_else(|| Error::ResourceNotFound {
            kind: "RBLNClusterPolicy".to_string(),
            name: name.to_string(),
        })?;
        policy.status = Some(status.clone());
        self.policy_status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_driver(&self, name: &str) -> Result<Option<RBLNDriver>> {
        Ok(self.drivers.lock().get(name).cloned())
    }

    async fn list_drivers(&self) -> Result<Vec<RBLNDriver>> {
        Ok(self.drivers.lock().values().cloned().collect())
    }

    async fn patch_driver_status(&self, name: &str, status: &RBLNDriverStatus) -> Result<()> {
        let mut drivers = self.drivers.lock();
        let driver = drivers.get_mut(name).ok_or_else(|| Error::ResourceNotFound {
            kind: "RBLNDriver".to_string(),
            name: name.to_string(),
        })?;
        driver.status = Some(status.clone());
        Ok(())
    }
}
