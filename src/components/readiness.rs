//! DaemonSet readiness judgement

use k8s_openapi::api::apps::v1::DaemonSet;

use crate::crd::{
    Condition, ConditionStatus, CONDITION_DAEMONSET_READY, REASON_DAEMONSET_ALL_PODS_READY,
    REASON_DAEMONSET_NOT_FOUND, REASON_DAEMONSET_PODS_NOT_READY,
};
use crate::domain::ClusterStore;

/// Scheduled, ready and unavailable pod counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodCounts {
    pub desired: i32,
    pub ready: i32,
    pub unavailable: i32,
}

impl PodCounts {
    pub fn of(ds: &DaemonSet) -> Self {
        ds.status
            .as_ref()
            .map(|status| PodCounts {
                desired: status.desired_number_scheduled,
                ready: status.number_ready,
                unavailable: status.number_unavailable.unwrap_or(0),
            })
            .unwrap_or_default()
    }

    /// A DaemonSet scheduled nowhere is not ready
    pub fn is_ready(&self) -> bool {
        self.desired > 0 && self.ready == self.desired && self.unavailable == 0
    }
}

pub fn daemonset_ready(ds: &DaemonSet) -> bool {
    PodCounts::of(ds).is_ready()
}

pub fn not_found_condition(namespace: &str, name: &str, cause: &str) -> Condition {
    Condition::new(
        CONDITION_DAEMONSET_READY,
        ConditionStatus::False,
        REASON_DAEMONSET_NOT_FOUND,
        format!("DaemonSet {}/{} could not be found: {}", namespace, name, cause),
    )
}

/// Condition describing one live DaemonSet
pub fn daemonset_condition(ds: &DaemonSet) -> Condition {
    let namespace = ds.metadata.namespace.as_deref().unwrap_or_default();
    let name = ds.metadata.name.as_deref().unwrap_or_default();
    let counts = PodCounts::of(ds);

    let condition = if counts.is_ready() {
        Condition::new(
            CONDITION_DAEMONSET_READY,
            ConditionStatus::True,
            REASON_DAEMONSET_ALL_PODS_READY,
            format!("All pods in DaemonSet {}/{} are running", namespace, name),
        )
    } else {
        Condition::new(
            CONDITION_DAEMONSET_READY,
            ConditionStatus::False,
            REASON_DAEMONSET_PODS_NOT_READY,
            format!(
                "DaemonSet {}/{} is progressing: {} of {} pods are Ready ({} unavailable)",
                namespace, name, counts.ready, counts.desired, counts.unavailable
            ),
        )
    };
    condition.with_observed_generation(ds.metadata.generation)
}

/// Fetch a DaemonSet and judge it; lookup failures become a NotFound condition
pub async fn daemonset_report(store: &dyn ClusterStore, namespace: &str, name: &str) -> Vec<Condition> {
    let condition = match store.get_daemonset(namespace, name).await {
        Ok(Some(ds)) => daemonset_condition(&ds),
        Ok(None) => not_found_condition(namespace, name, "not found"),
        Err(e) => not_found_condition(namespace, name, &e.to_string()),
    };
    vec![condition]
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DaemonSetStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn daemonset(desired: i32, ready: i32, unavailable: Option<i32>) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some("rbln-device-plugin".to_string()),
                namespace: Some("rbln-system".to_string()),
                generation: Some(3),
                ..Default::default()
            },
            status: Some(DaemonSetStatus {
                desired_number_scheduled: desired,
                number_ready: ready,
                number_unavailable: unavailable,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ready_requires_scheduled_pods() {
        assert!(daemonset_ready(&daemonset(3, 3, None)));
        assert!(daemonset_ready(&daemonset(3, 3, Some(0))));
        assert!(!daemonset_ready(&daemonset(0, 0, None)));
        assert!(!daemonset_ready(&daemonset(3, 2, Some(1))));
        assert!(!daemonset_ready(&daemonset(3, 3, Some(1))));
        assert!(!daemonset_ready(&DaemonSet::default()));
    }

    #[test]
    fn test_progressing_message() {
        let condition = daemonset_condition(&daemonset(3, 2, Some(1)));
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, REASON_DAEMONSET_PODS_NOT_READY);
        assert_eq!(
            condition.message,
            "DaemonSet rbln-system/rbln-device-plugin is progressing: 2 of 3 pods are Ready (1 unavailable)"
        );
        assert_eq!(condition.observed_generation, Some(3));
    }

    #[test]
    fn test_ready_message() {
        let condition = daemonset_condition(&daemonset(2, 2, None));
        assert!(condition.is_true());
        assert_eq!(condition.reason, REASON_DAEMONSET_ALL_PODS_READY);
        assert_eq!(condition.message, "All pods in DaemonSet rbln-system/rbln-device-plugin are running");
    }

    #[test]
    fn test_not_found_message() {
        let condition = not_found_condition("rbln-system", "rbln-npu-feature-discovery", "not found");
        assert_eq!(condition.reason, "DeamonSetNotFound");
        assert_eq!(
            condition.message,
            "DaemonSet rbln-system/rbln-npu-feature-discovery could not be found: not found"
        );
    }
}
