//! Cluster platform probes
//!
//! Detects OpenShift through its `ClusterVersion` object and the container
//! runtime through the node status reported by the kubelet.

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::components::ContainerRuntime;
use crate::error::Result;

const CLUSTER_VERSION_NAME: &str = "version";

/// Platform facts used when building component scopes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    /// `major.minor`; `None` off OpenShift
    pub openshift_version: Option<String>,
    pub container_runtime: Option<ContainerRuntime>,
}

/// `major.minor` of the first completed entry in a ClusterVersion's history
pub fn completed_openshift_version(cluster_version: &Value) -> Option<String> {
    let history = cluster_version.pointer("/status/history")?.as_array()?;
    let version = history
        .iter()
        .find(|entry| entry.get("state").and_then(Value::as_str) == Some("Completed"))?
        .get("version")?
        .as_str()?;

    let mut parts = version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) if !major.is_empty() && !minor.is_empty() => {
            Some(format!("{}.{}", major, minor))
        }
        _ => None,
    }
}

/// Runtime of the first node that reports one
pub fn runtime_from_nodes(nodes: &[Node]) -> Option<ContainerRuntime> {
    nodes.iter().find_map(|node| {
        let version = node.status.as_ref()?.node_info.as_ref()?.container_runtime_version.as_str();
        ContainerRuntime::from_runtime_version(version)
    })
}

pub async fn openshift_version(client: &Client) -> Result<Option<String>> {
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterVersion"));
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
    let cluster_version = match api.get_opt(CLUSTER_VERSION_NAME).await {
        Ok(Some(cv)) => cv,
        Ok(None) => return Ok(None),
        Err(kube::Error::Api(resp)) if resp.code == 404 => {
            debug!("ClusterVersion API not served, not running on OpenShift");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    Ok(completed_openshift_version(&serde_json::to_value(&cluster_version)?))
}

pub async fn container_runtime(client: &Client) -> Result<Option<ContainerRuntime>> {
    let api: Api<Node> = Api::all(client.clone());
    let nodes = api.list(&ListParams::default().limit(1)).await?;
    Ok(runtime_from_nodes(&nodes.items))
}

/// Probe both facts; failures are logged and leave the fact unset
pub async fn discover(client: &Client) -> ClusterInfo {
    let openshift_version = openshift_version(client).await.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read OpenShift ClusterVersion");
        None
    });
    let container_runtime = container_runtime(client).await.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to detect container runtime");
        None
    });
    info!(
        openshift = openshift_version.as_deref().unwrap_or("none"),
        runtime = ?container_runtime,
        "Discovered cluster platform"
    );
    ClusterInfo {
        openshift_version,
        container_runtime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeStatus, NodeSystemInfo};
    use serde_json::json;

    #[test]
    fn test_first_completed_history_entry_wins() {
        let cv = json!({
            "status": {
                "history": [
                    { "state": "Partial", "version": "4.17.0" },
                    { "state": "Completed", "version": "4.16.12" },
                    { "state": "Completed", "version": "4.15.3" }
                ]
            }
        });
        assert_eq!(completed_openshift_version(&cv), Some("4.16".to_string()));
    }

    #[test]
    fn test_no_completed_entry() {
        let cv = json!({ "status": { "history": [{ "state": "Partial", "version": "4.16.0" }] } });
        assert_eq!(completed_openshift_version(&cv), None);
        assert_eq!(completed_openshift_version(&json!({})), None);
        let malformed = json!({ "status": { "history": [{ "state": "Completed", "version": "4" }] } });
        assert_eq!(completed_openshift_version(&malformed), None);
    }

    #[test]
    fn test_runtime_from_first_reporting_node() {
        let node = |runtime: &str| Node {
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    container_runtime_version: runtime.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let nodes = vec![Node::default(), node("cri-o://1.29.1"), node("containerd://1.7.2")];
        assert_eq!(runtime_from_nodes(&nodes), Some(ContainerRuntime::Crio));
        assert_eq!(runtime_from_nodes(&[]), None);
    }
}
