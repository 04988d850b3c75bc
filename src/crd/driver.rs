//! RBLNDriver CRD
//!
//! Selects a set of nodes and the driver version installed on them. Node
//! selectors of different RBLNDriver objects must not overlap.

use k8s_openapi::api::core::v1::{EnvVar, NodeAffinity, ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::cluster_policy::DEFAULT_PRIORITY_CLASS;
use super::condition::Condition;
use crate::components::image;
use crate::error::Result;

/// Label every driver node selector implicitly requires
pub const DRIVER_DEPLOY_LABEL: &str = "rebellions.ai/npu.deploy.driver";

// =============================================================================
// RBLNDriver CRD
// =============================================================================

/// RBLNDriver installs the Rebellions kernel driver on the nodes it selects,
/// using a precompiled image per OS and kernel combination.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "rebellions.ai",
    version = "v1alpha1",
    kind = "RBLNDriver",
    plural = "rblndrivers",
    status = "RBLNDriverStatus",
    printcolumn = r#"{"name": "Version", "type": "string", "jsonPath": ".spec.version"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct RBLNDriverSpec {
    #[serde(default = "default_registry")]
    pub registry: String,

    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub image_pull_policy: Option<String>,

    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    /// Driver manager init container
    #[serde(default)]
    pub manager: DriverManagerSpec,

    /// Nodes to install the driver on
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default = "default_priority_class")]
    pub priority_class_name: String,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Installer arguments; `init` when empty
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl Default for RBLNDriverSpec {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            image: default_image(),
            version: String::new(),
            image_pull_policy: None,
            image_pull_secrets: Vec::new(),
            manager: DriverManagerSpec::default(),
            node_selector: BTreeMap::new(),
            node_affinity: None,
            tolerations: Vec::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            priority_class_name: default_priority_class(),
            resources: None,
            args: Vec::new(),
            env: Vec::new(),
        }
    }
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Driver manager init container settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverManagerSpec {
    #[serde(default)]
    pub registry: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub image_pull_policy: Option<String>,

    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    #[serde(default)]
    pub env: Vec<ManagerEnvVar>,
}

/// Plain name/value environment entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ManagerEnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum DriverState {
    Ready,
    NotReady,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverState::Ready => write!(f, "ready"),
            DriverState::NotReady => write!(f, "notReady"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RBLNDriverStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DriverState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_registry() -> String {
    "repo.rebellions.ai".to_string()
}

fn default_image() -> String {
    "rebellions/rbln-driver".to_string()
}

fn default_priority_class() -> String {
    DEFAULT_PRIORITY_CLASS.to_string()
}

// =============================================================================
// Implementations
// =============================================================================

impl RBLNDriverSpec {
    /// Image reference of the precompiled driver for one OS and kernel
    pub fn precompiled_image_path(&self, os_version: &str, kernel_version: &str) -> Result<String> {
        image::precompiled_image_path(
            &self.registry,
            &self.image,
            &self.version,
            kernel_version,
            os_version,
        )
    }
}

impl RBLNDriver {
    /// Node selector, defaulting to the driver deploy label
    pub fn node_selector(&self) -> BTreeMap<String, String> {
        if self.spec.node_selector.is_empty() {
            BTreeMap::from([(DRIVER_DEPLOY_LABEL.to_string(), "true".to_string())])
        } else {
            self.spec.node_selector.clone()
        }
    }
}

impl RBLNDriverStatus {
    pub fn set_state(&mut self, state: DriverState) -> bool {
        if self.state == Some(state) {
            return false;
        }
        self.state = Some(state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_defaults() {
        let spec: RBLNDriverSpec = serde_json::from_value(serde_json::json!({
            "version": "1.3.0"
        }))
        .unwrap();
        assert_eq!(spec.registry, "repo.rebellions.ai");
        assert_eq!(spec.image, "rebellions/rbln-driver");
        assert_eq!(spec.priority_class_name, "system-node-critical");
        assert!(spec.args.is_empty());
    }

    #[test]
    fn test_default_node_selector() {
        let driver = RBLNDriver::new("default", RBLNDriverSpec::default());
        let selector = driver.node_selector();
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.get(DRIVER_DEPLOY_LABEL).map(String::as_str), Some("true"));

        let mut spec = RBLNDriverSpec::default();
        spec.node_selector.insert("pool".to_string(), "a".to_string());
        let driver = RBLNDriver::new("pool-a", spec);
        assert_eq!(driver.node_selector().get("pool").map(String::as_str), Some("a"));
        assert!(!driver.node_selector().contains_key(DRIVER_DEPLOY_LABEL));
    }

    #[test]
    fn test_precompiled_path_from_spec() {
        let spec = RBLNDriverSpec {
            registry: "registry.example.com/".to_string(),
            image: "/vendor/driver".to_string(),
            version: "1.2.3".to_string(),
            ..Default::default()
        };
        assert_eq!(
            spec.precompiled_image_path("ubuntu22.04", "5.15.0-generic").unwrap(),
            "registry.example.com/vendor/driver:1.2.3-5.15.0-generic-ubuntu22.04"
        );
    }
}
