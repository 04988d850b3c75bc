//! Custom Resource Definitions for the RBLN NPU Operator
//!
//! This module contains all CRD types:
//! - RBLNClusterPolicy: cluster-wide singleton describing the NPU stack
//! - RBLNDriver: per node selector driver installation
//! - Condition: status condition shared by both

pub mod cluster_policy;
pub mod condition;
pub mod driver;

pub use cluster_policy::*;
pub use condition::*;
pub use driver::*;

use kube::CustomResourceExt;

/// Render both CRD manifests as a multi-document YAML stream
pub fn crd_manifests() -> crate::Result<String> {
    let policy = serde_yaml::to_string(&RBLNClusterPolicy::crd())?;
    let driver = serde_yaml::to_string(&RBLNDriver::crd())?;
    Ok(format!("{}---\n{}", policy, driver))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crds_are_cluster_scoped() {
        let policy = RBLNClusterPolicy::crd();
        assert_eq!(policy.spec.scope, "Cluster");
        assert_eq!(policy.spec.group, "rebellions.ai");
        assert_eq!(
            policy.spec.names.short_names,
            Some(vec!["rcp".to_string(), "rblncp".to_string()])
        );

        let driver = RBLNDriver::crd();
        assert_eq!(driver.spec.scope, "Cluster");
        assert_eq!(driver.spec.versions[0].name, "v1alpha1");
    }

    #[test]
    fn test_crd_manifests_render() {
        let yaml = crd_manifests().unwrap();
        assert!(yaml.contains("rblnclusterpolicies.rebellions.ai"));
        assert!(yaml.contains("rblndrivers.rebellions.ai"));
    }
}
