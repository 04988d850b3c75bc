//! Node pool partitioning for precompiled drivers
//!
//! Nodes sharing the same OS id, OS version and kernel form one pool. Each
//! pool gets its own driver DaemonSet whose node selector pins it to exactly
//! that tuple.

use k8s_openapi::api::core::v1::Node;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::crd::DRIVER_DEPLOY_LABEL;
use crate::domain::ClusterStore;
use crate::error::Result;

pub const NFD_OS_RELEASE_ID_LABEL: &str = "feature.node.kubernetes.io/system-os_release.ID";
pub const NFD_OS_VERSION_ID_LABEL: &str = "feature.node.kubernetes.io/system-os_release.VERSION_ID";
pub const NFD_KERNEL_LABEL: &str = "feature.node.kubernetes.io/kernel-version.full";

static ARCH_SUFFIX: OnceLock<Regex> = OnceLock::new();

fn arch_suffix_regex() -> &'static Regex {
    ARCH_SUFFIX.get_or_init(|| {
        Regex::new(r"x86_64(?:_64k)?|aarch64(?:_64k)?").expect("Failed to compile kernel arch regex")
    })
}

/// Group of nodes with identical OS and kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePool {
    pub name: String,
    pub os_release: String,
    pub os_version: String,
    pub kernel: String,
    pub node_selector: BTreeMap<String, String>,
}

impl NodePool {
    /// `{os-id}{os-version}`, e.g. `ubuntu22.04`
    pub fn os(&self) -> String {
        format!("{}{}", self.os_release, self.os_version)
    }
}

/// Strip architecture suffixes and normalize a kernel string for object names
pub fn sanitize_kernel_version(kernel: &str) -> String {
    let stripped = arch_suffix_regex().replace_all(kernel, "");
    let dotted = stripped.replace('_', ".");
    dotted.strip_suffix('.').unwrap_or(&dotted).to_lowercase()
}

/// Driver deploy label plus the caller's selector
pub fn build_node_selector(selector: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut node_selector = BTreeMap::from([(DRIVER_DEPLOY_LABEL.to_string(), "true".to_string())]);
    node_selector.extend(selector.iter().map(|(k, v)| (k.clone(), v.clone())));
    node_selector
}

fn node_label<'a>(labels: &'a BTreeMap<String, String>, node: &str, key: &str) -> Option<&'a str> {
    let value = labels.get(key).map(String::as_str);
    if value.is_none() {
        warn!(node = %node, label = %key, "Could not find NFD label for node. Is NFD installed?");
    }
    value
}

/// Pool of one node, or `None` when a discovery label is missing
pub fn build_node_pool(node: &Node, base_selector: &BTreeMap<String, String>) -> Option<NodePool> {
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    let node_name = node.metadata.name.as_deref().unwrap_or_default();

    let os_release = node_label(labels, node_name, NFD_OS_RELEASE_ID_LABEL)?;
    let os_version = node_label(labels, node_name, NFD_OS_VERSION_ID_LABEL)?;
    let kernel = node_label(labels, node_name, NFD_KERNEL_LABEL)?;

    let mut node_selector = base_selector.clone();
    node_selector.insert(NFD_OS_RELEASE_ID_LABEL.to_string(), os_release.to_string());
    node_selector.insert(NFD_OS_VERSION_ID_LABEL.to_string(), os_version.to_string());
    node_selector.insert(NFD_KERNEL_LABEL.to_string(), kernel.to_string());

    Some(NodePool {
        name: format!("{}{}-{}", os_release, os_version, sanitize_kernel_version(kernel)),
        os_release: os_release.to_string(),
        os_version: os_version.to_string(),
        kernel: kernel.to_string(),
        node_selector,
    })
}

/// Distinct pools across `nodes`, ordered by name
pub fn partition_nodes(nodes: &[Node], base_selector: &BTreeMap<String, String>) -> Vec<NodePool> {
    let mut pools: BTreeMap<String, NodePool> = BTreeMap::new();
    for node in nodes {
        let Some(pool) = build_node_pool(node, base_selector) else {
            continue;
        };
        if !pools.contains_key(&pool.name) {
            info!(pool = %pool.name, os = %pool.os(), kernel = %pool.kernel, "Detected new node pool");
            pools.insert(pool.name.clone(), pool);
        }
    }
    pools.into_values().collect()
}

/// List nodes matching `selector` and partition them
pub async fn node_pools(
    store: &dyn ClusterStore,
    selector: &BTreeMap<String, String>,
) -> Result<Vec<NodePool>> {
    let base_selector = build_node_selector(selector);
    let nodes = store.list_nodes(&base_selector).await?;
    Ok(partition_nodes(&nodes, &base_selector))
}
