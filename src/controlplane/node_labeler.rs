//! NPU node labeling
//!
//! Turns the PCI labels published by node-feature-discovery into the
//! `rebellions.ai/npu.present` label and the per-component deploy labels
//! every component DaemonSet schedules on. Only nodes whose labels actually
//! change are patched.

use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::components::builders::DEPLOY_LABEL_PREFIX;
use crate::components::{
    CONTAINER_TOOLKIT, DEVICE_PLUGIN, METRICS_EXPORTER, NPU_FEATURE_DISCOVERY, OPERATOR_VALIDATOR, RBLN_DAEMON,
    SANDBOX_DEVICE_PLUGIN, VFIO_MANAGER,
};
use crate::crd::{WorkloadType, DRIVER_DEPLOY_LABEL};
use crate::domain::ClusterStore;
use crate::error::Result;

pub const NFD_LABEL_PREFIX: &str = "feature.node.kubernetes.io/";
pub const NPU_PRESENT_LABEL: &str = "rebellions.ai/npu.present";
pub const WORKLOAD_CONFIG_LABEL: &str = "rebellions.ai/npu.workload.config";

const DEVICE_LABELS: [&str; 2] = [
    "feature.node.kubernetes.io/pci-1200_1eff.present",
    "feature.node.kubernetes.io/pci-1eff.present",
];

const CONTAINER_COMPONENTS: [&str; 6] = [
    DEVICE_PLUGIN,
    METRICS_EXPORTER,
    NPU_FEATURE_DISCOVERY,
    CONTAINER_TOOLKIT,
    RBLN_DAEMON,
    OPERATOR_VALIDATOR,
];

const VM_PASSTHROUGH_COMPONENTS: [&str; 2] = [VFIO_MANAGER, SANDBOX_DEVICE_PLUGIN];

/// Deploy labels a node running `workload` should carry
pub fn deploy_labels(workload: WorkloadType) -> Vec<String> {
    match workload {
        WorkloadType::Container => std::iter::once(DRIVER_DEPLOY_LABEL.to_string())
            .chain(CONTAINER_COMPONENTS.iter().map(|c| format!("{}{}", DEPLOY_LABEL_PREFIX, c)))
            .collect(),
        WorkloadType::VmPassthrough => VM_PASSTHROUGH_COMPONENTS
            .iter()
            .map(|c| format!("{}{}", DEPLOY_LABEL_PREFIX, c))
            .collect(),
    }
}

fn all_deploy_labels() -> Vec<String> {
    let mut labels = deploy_labels(WorkloadType::Container);
    labels.extend(deploy_labels(WorkloadType::VmPassthrough));
    labels
}

pub fn has_nfd_labels(labels: &BTreeMap<String, String>) -> bool {
    labels.keys().any(|key| key.starts_with(NFD_LABEL_PREFIX))
}

pub fn has_device_label(labels: &BTreeMap<String, String>) -> bool {
    DEVICE_LABELS
        .iter()
        .any(|key| labels.get(*key).map(String::as_str) == Some("true"))
}

fn is_present(labels: &BTreeMap<String, String>) -> bool {
    labels.get(NPU_PRESENT_LABEL).map(String::as_str) == Some("true")
}

/// Workload from the node label, or the policy default when absent or invalid
pub fn workload_for(labels: &BTreeMap<String, String>, default: WorkloadType) -> WorkloadType {
    match labels.get(WORKLOAD_CONFIG_LABEL) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(workload = %value, default = %default, "Invalid NPU workload config label, using default");
            default
        }),
        None => default,
    }
}

/// Label edits collected for one node; `None` removes a label
struct LabelEdit {
    labels: BTreeMap<String, String>,
    changes: BTreeMap<String, Option<String>>,
}

impl LabelEdit {
    fn new(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            changes: BTreeMap::new(),
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        if self.labels.get(key).map(String::as_str) != Some(value) {
            self.labels.insert(key.to_string(), value.to_string());
            self.changes.insert(key.to_string(), Some(value.to_string()));
        }
    }

    fn add_missing(&mut self, key: &str, value: &str) {
        if !self.labels.contains_key(key) {
            self.set(key, value);
        }
    }

    fn remove(&mut self, key: &str) {
        if self.labels.remove(key).is_some() {
            self.changes.insert(key.to_string(), None);
        }
    }
}

/// Label changes one node needs, and whether it counts as an NPU node
pub fn plan_node_labels(
    node_name: &str,
    labels: &BTreeMap<String, String>,
    default_workload: WorkloadType,
) -> (BTreeMap<String, Option<String>>, bool) {
    let mut edit = LabelEdit::new(labels.clone());
    let device = has_device_label(labels);

    if !is_present(labels) && device {
        info!(node = %node_name, "Rebellions device detected, labeling node as NPU present");
        edit.set(NPU_PRESENT_LABEL, "true");
    } else if is_present(labels) && !device {
        info!(node = %node_name, "Rebellions device removed, clearing NPU labels");
        edit.set(NPU_PRESENT_LABEL, "false");
        for key in all_deploy_labels() {
            edit.remove(&key);
        }
    }

    let npu_node = is_present(&edit.labels);
    if npu_node {
        let workload = workload_for(&edit.labels, default_workload);
        let wanted = deploy_labels(workload);
        for key in all_deploy_labels() {
            if !wanted.contains(&key) {
                edit.remove(&key);
            }
        }
        for key in &wanted {
            edit.add_missing(key, "true");
        }
    }
    (edit.changes, npu_node)
}

/// Result of one labeling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLabelReport {
    /// Whether any node carries node-feature-discovery labels
    pub nfd_installed: bool,
    pub npu_nodes: usize,
}

pub async fn label_npu_nodes(store: &dyn ClusterStore, default_workload: WorkloadType) -> Result<NodeLabelReport> {
    let nodes: Vec<Node> = store.list_nodes(&BTreeMap::new()).await?;
    let empty = BTreeMap::new();

    let mut report = NodeLabelReport {
        nfd_installed: false,
        npu_nodes: 0,
    };
    for node in &nodes {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
        report.nfd_installed |= has_nfd_labels(labels);

        let (changes, npu_node) = plan_node_labels(name, labels, default_workload);
        if npu_node {
            report.npu_nodes += 1;
        }
        if !changes.is_empty() {
            store.patch_node_labels(name, &changes).await?;
        }
    }
    Ok(report)
}
