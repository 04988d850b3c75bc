//! Driver node selector overlap check
//!
//! Two RBLNDriver objects must never select the same node, otherwise their
//! DaemonSets would install two drivers onto one host.

use std::collections::BTreeMap;
use tracing::debug;

use crate::crd::RBLNDriver;
use crate::domain::ClusterStore;
use crate::error::{Error, Result};

fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.and_then(|l| l.get(key)) == Some(value))
}

/// Fail when a node selected by `driver` is also selected by another driver
pub async fn validate_node_selector(store: &dyn ClusterStore, driver: &RBLNDriver) -> Result<()> {
    let selector = driver.node_selector();
    let nodes = store.list_nodes(&selector).await?;
    if nodes.is_empty() {
        return Ok(());
    }

    let name = driver.metadata.name.as_deref().unwrap_or_default();
    for other in store.list_drivers().await? {
        let other_name = other.metadata.name.as_deref().unwrap_or_default();
        if other_name == name {
            continue;
        }
        let other_selector = other.node_selector();
        if let Some(node) = nodes
            .iter()
            .find(|node| labels_match(node.metadata.labels.as_ref(), &other_selector))
        {
            debug!(
                driver = %name,
                other = %other_name,
                node = node.metadata.name.as_deref().unwrap_or_default(),
                "Node selected by two drivers"
            );
            return Err(Error::NodeSelectorConflict(format!(
                "nodeSelector conflicts with RBLNDriver \"{}\"",
                other_name
            )));
        }
    }
    Ok(())
}
