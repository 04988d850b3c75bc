//! Control plane
//!
//! The two controllers and everything they reconcile with: the Kubernetes
//! backed store, cluster discovery, node labeling, scopes and status
//! aggregation.

pub mod backoff;
pub mod cluster_info;
pub mod cluster_policy_controller;
pub mod driver_controller;
pub mod kube_store;
pub mod metrics;
pub mod node_labeler;
pub mod node_selector;
pub mod scope;
pub mod singleton;
pub mod status;
pub mod watch;

use std::time::Duration;

pub use cluster_info::ClusterInfo;
pub use kube_store::KubeStore;
pub use metrics::ReconcileMetrics;
pub use scope::Scope;
pub use singleton::{Claim, SingletonGuard};

/// Settings shared by both controllers
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Fallback namespace when a policy does not name one
    pub operator_namespace: Option<String>,
    /// Requeue interval after a successful pass
    pub resync: Duration,
    pub cluster_info: ClusterInfo,
}
