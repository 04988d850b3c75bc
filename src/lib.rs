//! RBLN NPU Operator
//!
//! A Kubernetes operator that deploys the Rebellions NPU software stack onto
//! every node carrying a Rebellions accelerator and reports its readiness.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Controllers                                     │
//! │  ┌──────────────────────────────────┐  ┌──────────────────────────────────┐  │
//! │  │   RBLNClusterPolicy controller   │  │      RBLNDriver controller       │  │
//! │  │  singleton latch, node labeling  │  │  selector overlap, node pools    │  │
//! │  └────────────────┬─────────────────┘  └────────────────┬─────────────────┘  │
//! │                   └───────────────┬────────────────────┘                    │
//! │                          ┌────────┴────────┐                                 │
//! │                          │      Scope      │  ordered component patchers     │
//! │                          └────────┬────────┘                                 │
//! ├───────────────────────────────────┼─────────────────────────────────────────┤
//! │                              Components                                      │
//! │  vfio-manager │ sandbox-device-plugin │ container-toolkit │ validator        │
//! │  rbln-daemon  │ device-plugin │ dra-kubelet-plugin │ metrics-exporter        │
//! │  npu-feature-discovery │ rbln-driver (one DaemonSet per OS/kernel pool)      │
//! ├───────────────────────────────────┼─────────────────────────────────────────┤
//! │                        ClusterStore (trait)                                  │
//! │       KubeStore: server-side apply, dynamic API discovery, status patch      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Controllers, scopes, node labeling and status rollup
//! - [`components`]: Desired objects and readiness for each managed component
//! - [`crd`]: RBLNClusterPolicy and RBLNDriver custom resources
//! - [`domain`]: Store and component traits
//! - [`error`]: Error types and requeue actions

pub mod components;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use controlplane::{ClusterInfo, ControllerConfig, KubeStore, ReconcileMetrics, Scope, SingletonGuard};

pub use crd::{
    ClusterState, Condition, DriverState, RBLNClusterPolicy, RBLNClusterPolicySpec, RBLNClusterPolicyStatus,
    RBLNDriver, RBLNDriverSpec, RBLNDriverStatus, WorkloadType,
};

pub use domain::{ClusterStore, ClusterStoreRef, ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};

pub use error::{Error, ErrorAction, Result};

/// Operator version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Operator name
pub const NAME: &str = env!("CARGO_PKG_NAME");
