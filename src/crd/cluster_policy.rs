//! RBLNClusterPolicy CRD
//!
//! The cluster-wide singleton describing which NPU components run on the
//! cluster and how each of them is configured.

use k8s_openapi::api::core::v1::{Affinity, EnvVar, ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::Condition;

// =============================================================================
// RBLNClusterPolicy CRD
// =============================================================================

/// RBLNClusterPolicy declares the NPU software stack for the whole cluster.
/// Only the first instance observed by the operator is acted upon.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "rebellions.ai",
    version = "v1beta1",
    kind = "RBLNClusterPolicy",
    plural = "rblnclusterpolicies",
    shortname = "rcp",
    shortname = "rblncp",
    status = "RBLNClusterPolicyStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Workload", "type": "string", "jsonPath": ".spec.workloadType"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct RBLNClusterPolicySpec {
    /// Prefix for every managed object name
    #[serde(rename = "name", default = "default_base_name")]
    pub base_name: String,

    /// Namespace the components are deployed into
    #[serde(default)]
    pub namespace: Option<String>,

    /// Workload type for nodes without an explicit workload label
    #[serde(default)]
    pub workload_type: WorkloadType,

    /// Defaults shared by every component DaemonSet
    #[serde(default)]
    pub daemonsets: Option<DaemonsetsSpec>,

    #[serde(default)]
    pub vfio_manager: Option<VfioManagerSpec>,

    #[serde(default)]
    pub sandbox_device_plugin: Option<SandboxDevicePluginSpec>,

    #[serde(default)]
    pub device_plugin: Option<DevicePluginSpec>,

    #[serde(default)]
    pub metrics_exporter: Option<MetricsExporterSpec>,

    #[serde(default)]
    pub npu_feature_discovery: Option<NpuFeatureDiscoverySpec>,

    #[serde(default)]
    pub container_toolkit: Option<ContainerToolkitSpec>,

    #[serde(default)]
    pub rbln_daemon: Option<RblnDaemonSpec>,

    #[serde(default)]
    pub dra_kubelet_plugin: Option<DraKubeletPluginSpec>,

    /// Validator is deployed exactly when this block is present
    #[serde(default)]
    pub validator: Option<ValidatorSpec>,
}

impl Default for RBLNClusterPolicySpec {
    fn default() -> Self {
        Self {
            base_name: default_base_name(),
            namespace: None,
            workload_type: WorkloadType::default(),
            daemonsets: None,
            vfio_manager: None,
            sandbox_device_plugin: None,
            device_plugin: None,
            metrics_exporter: None,
            npu_feature_discovery: None,
            container_toolkit: None,
            rbln_daemon: None,
            dra_kubelet_plugin: None,
            validator: None,
        }
    }
}

// =============================================================================
// Workload Type
// =============================================================================

/// How NPUs on a node are consumed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadType {
    /// NPUs are handed to containers through the device plugin
    #[default]
    Container,
    /// NPUs are bound to vfio-pci and passed through to virtual machines
    VmPassthrough,
}

impl WorkloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Container => "container",
            WorkloadType::VmPassthrough => "vm-passthrough",
        }
    }
}

impl std::fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkloadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(WorkloadType::Container),
            "vm-passthrough" => Ok(WorkloadType::VmPassthrough),
            other => Err(format!("invalid NPU workload config: {}", other)),
        }
    }
}

// =============================================================================
// Shared Pod Settings
// =============================================================================

/// Cluster-wide DaemonSet defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonsetsSpec {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub affinity: Option<Affinity>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub priority_class_name: Option<String>,
}

/// Image and scheduling settings embedded in every component spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPodSpec {
    /// Registry prefix; when empty the image is used as-is
    #[serde(default)]
    pub registry: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    /// Image tag; empty means `latest`
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub image_pull_policy: Option<String>,

    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub affinity: Option<Affinity>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub priority_class_name: Option<String>,
}

impl ComponentPodSpec {
    /// Fill unset fields from the cluster-wide defaults.
    ///
    /// Labels and annotations are merged key by key with the component's own
    /// entries winning. Affinity, tolerations and priority class are only
    /// taken when the component leaves them empty.
    pub fn inherit(&mut self, defaults: &DaemonsetsSpec) {
        let mut labels = defaults.labels.clone();
        labels.append(&mut self.labels);
        self.labels = labels;

        let mut annotations = defaults.annotations.clone();
        annotations.append(&mut self.annotations);
        self.annotations = annotations;

        if self.affinity.is_none() {
            self.affinity = defaults.affinity.clone();
        }
        if self.tolerations.is_empty() {
            self.tolerations = defaults.tolerations.clone();
        }
        if self.priority_class_name.as_deref().unwrap_or_default().is_empty() {
            self.priority_class_name = defaults.priority_class_name.clone();
        }
    }

    /// Image pull policy, `IfNotPresent` when unset
    pub fn pull_policy(&self) -> &str {
        match self.image_pull_policy.as_deref() {
            Some(policy) if !policy.is_empty() => policy,
            _ => "IfNotPresent",
        }
    }
}

/// Behavior common to every component variant.
///
/// Each variant carries a [`ComponentPodSpec`] and states its own image and
/// priority class defaults.
pub trait ComponentSpec: Clone {
    const DEFAULT_IMAGE: &'static str;
    const DEFAULT_PRIORITY_CLASS: Option<&'static str> = None;

    fn is_enabled(&self) -> bool;
    fn pod(&self) -> &ComponentPodSpec;
    fn pod_mut(&mut self) -> &mut ComponentPodSpec;

    /// A copy of this spec with cluster defaults and variant defaults applied
    fn with_defaults(&self, defaults: Option<&DaemonsetsSpec>) -> Self {
        let mut merged = self.clone();
        let pod = merged.pod_mut();
        if let Some(defaults) = defaults {
            pod.inherit(defaults);
        }
        if pod.image.as_deref().unwrap_or_default().is_empty() {
            pod.image = Some(Self::DEFAULT_IMAGE.to_string());
        }
        if pod.priority_class_name.as_deref().unwrap_or_default().is_empty() {
            pod.priority_class_name = Self::DEFAULT_PRIORITY_CLASS.map(str::to_string);
        }
        merged
    }
}

macro_rules! component_spec {
    ($ty:ty, $image:expr) => {
        component_spec!($ty, $image, None);
    };
    ($ty:ty, $image:expr, $priority:expr) => {
        impl ComponentSpec for $ty {
            const DEFAULT_IMAGE: &'static str = $image;
            const DEFAULT_PRIORITY_CLASS: Option<&'static str> = $priority;

            fn is_enabled(&self) -> bool {
                self.enabled
            }

            fn pod(&self) -> &ComponentPodSpec {
                &self.pod
            }

            fn pod_mut(&mut self) -> &mut ComponentPodSpec {
                &mut self.pod
            }
        }
    };
}

// =============================================================================
// Component Specs
// =============================================================================

/// Binds NPUs to vfio-pci for VM passthrough
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VfioManagerSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub pod: ComponentPodSpec,
}

component_spec!(
    VfioManagerSpec,
    "rebellions/rbln-vfio-manager",
    Some(DEFAULT_PRIORITY_CLASS)
);

/// Device plugin advertising vfio-bound NPUs
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxDevicePluginSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub pod: ComponentPodSpec,

    /// Image of the init container waiting for vfio binding
    #[serde(default)]
    pub vfio_checker: ImageSpec,

    #[serde(default = "default_resource_list")]
    pub resource_list: Vec<DevicePluginResource>,
}

component_spec!(
    SandboxDevicePluginSpec,
    "rebellions/k8s-device-plugin",
    Some(DEFAULT_PRIORITY_CLASS)
);

/// Device plugin advertising NPUs to containers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub pod: ComponentPodSpec,

    /// Host directory holding `rbln-smi`
    #[serde(default = "default_host_bin_path")]
    pub host_bin_path: String,

    #[serde(default = "default_resource_list")]
    pub resource_list: Vec<DevicePluginResource>,
}

component_spec!(DevicePluginSpec, "rebellions/k8s-device-plugin");

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsExporterSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub pod: ComponentPodSpec,
}

component_spec!(MetricsExporterSpec, "rebellions/rbln-metrics-exporter");

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NpuFeatureDiscoverySpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub pod: ComponentPodSpec,
}

component_spec!(NpuFeatureDiscoverySpec, "rebellions/rbln-npu-feature-discovery");

/// Configures the container runtime for NPU access through CDI
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerToolkitSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub pod: ComponentPodSpec,

    /// Extra environment for the toolkit daemon
    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub args: Vec<String>,
}

component_spec!(ContainerToolkitSpec, "rebellions/rbln-container-toolkit");

/// Node-local daemon exposing NPU state over gRPC
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RblnDaemonSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub pod: ComponentPodSpec,

    #[serde(default = "default_daemon_port")]
    pub host_port: i32,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: Vec<EnvVar>,
}

component_spec!(RblnDaemonSpec, "rebellions/rbln-daemon");

/// Dynamic Resource Allocation kubelet plugin
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DraKubeletPluginSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(flatten)]
    pub pod: ComponentPodSpec,

    /// Driver name registered with the kubelet and used as the class name
    #[serde(default = "default_dra_driver_name")]
    pub driver_name: String,

    #[serde(default = "default_kubelet_registrar_dir")]
    pub kubelet_registrar_directory_path: String,

    #[serde(default = "default_kubelet_plugins_dir")]
    pub kubelet_plugins_directory_path: String,

    /// Port of the plugin's gRPC health endpoint; 0 disables the probe
    #[serde(default)]
    pub healthcheck_port: i32,
}

component_spec!(DraKubeletPluginSpec, "rebellions/rbln-dra-kubelet-plugin");

/// Driver and toolkit validation gate
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorSpec {
    #[serde(flatten)]
    pub pod: ComponentPodSpec,

    /// Arguments appended to every validation step
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment shared by every validation step
    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub driver: ValidatorStepSpec,

    #[serde(default)]
    pub toolkit: ValidatorStepSpec,
}

impl ComponentSpec for ValidatorSpec {
    const DEFAULT_IMAGE: &'static str = "rebellions/rbln-operator-validator";

    fn is_enabled(&self) -> bool {
        true
    }

    fn pod(&self) -> &ComponentPodSpec {
        &self.pod
    }

    fn pod_mut(&mut self) -> &mut ComponentPodSpec {
        &mut self.pod
    }
}

/// Per-step validator overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorStepSpec {
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Image coordinates without scheduling settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    #[serde(default)]
    pub registry: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub version: Option<String>,
}

/// One extended resource advertised by a device plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginResource {
    #[serde(default = "default_resource_name")]
    pub resource_name: String,

    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,

    /// Product card names, e.g. `RBLN-CA22`
    #[serde(default = "default_product_cards")]
    pub product_card_names: Vec<String>,
}

impl Default for DevicePluginResource {
    fn default() -> Self {
        Self {
            resource_name: default_resource_name(),
            resource_prefix: default_resource_prefix(),
            product_card_names: default_product_cards(),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Overall state of the cluster policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ClusterState {
    Ready,
    NotReady,
    /// Another RBLNClusterPolicy is authoritative
    Ignored,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterState::Ready => write!(f, "ready"),
            ClusterState::NotReady => write!(f, "notReady"),
            ClusterState::Ignored => write!(f, "ignored"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ComponentState {
    Ready,
    NotReady,
}

/// Readiness of one enabled component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub name: String,
    pub namespace: String,
    pub state: ComponentState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub condition: Vec<Condition>,
}

/// Status of the RBLNClusterPolicy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RBLNClusterPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ClusterState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Default Value Functions
// =============================================================================

pub const DEFAULT_PRIORITY_CLASS: &str = "system-node-critical";
pub const DEFAULT_DRA_DRIVER_NAME: &str = "npu.rebellions.ai";

fn default_true() -> bool {
    true
}

fn default_base_name() -> String {
    "rbln".to_string()
}

fn default_host_bin_path() -> String {
    "/usr/bin".to_string()
}

fn default_daemon_port() -> i32 {
    50051
}

fn default_dra_driver_name() -> String {
    DEFAULT_DRA_DRIVER_NAME.to_string()
}

fn default_kubelet_registrar_dir() -> String {
    "/var/lib/kubelet/plugins_registry".to_string()
}

fn default_kubelet_plugins_dir() -> String {
    "/var/lib/kubelet/plugins".to_string()
}

fn default_resource_name() -> String {
    "ATOM".to_string()
}

fn default_resource_prefix() -> String {
    "rebellions.ai".to_string()
}

fn default_product_cards() -> Vec<String> {
    vec![
        "RBLN-CA12".to_string(),
        "RBLN-CA22".to_string(),
        "RBLN-CA25".to_string(),
    ]
}

fn default_resource_list() -> Vec<DevicePluginResource> {
    vec![DevicePluginResource::default()]
}

// =============================================================================
// Implementations
// =============================================================================

impl RBLNClusterPolicySpec {
    /// `spec.namespace`, falling back to the operator's own namespace
    pub fn target_namespace(&self, operator_namespace: Option<&str>) -> Option<String> {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .or(operator_namespace.filter(|ns| !ns.is_empty()))
            .map(str::to_string)
    }

    /// Whether the container toolkit will be deployed
    pub fn container_toolkit_enabled(&self) -> bool {
        self.container_toolkit
            .as_ref()
            .is_some_and(ComponentSpec::is_enabled)
    }
}

impl RBLNClusterPolicyStatus {
    /// Replace the state, returning whether it changed
    pub fn set_state(&mut self, state: ClusterState) -> bool {
        if self.state == Some(state) {
            return false;
        }
        self.state = Some(state);
        true
    }
}
