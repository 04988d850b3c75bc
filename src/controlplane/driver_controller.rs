//! RBLNDriver controller
//!
//! Each driver object installs the NPU kernel driver onto the nodes its
//! selector picks, one DaemonSet per OS/kernel pool. The driver cannot do
//! anything until an RBLNClusterPolicy exists, since the policy decides the
//! target namespace.

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::RetryBackoff;
use super::metrics::ReconcileMetrics;
use super::node_selector::validate_node_selector;
use super::scope::Scope;
use super::singleton::SingletonGuard;
use super::status::{apply_driver_failure, apply_driver_not_ready, apply_driver_readiness};
use super::watch::{owners_of, NodeLabelFilter};
use super::ControllerConfig;
use crate::crd::{RBLNClusterPolicy, RBLNDriver, RBLNDriverStatus, REASON_MISSING_CLUSTER_POLICY};
use crate::domain::ClusterStoreRef;
use crate::error::{Error, Result};

pub const CONTROLLER_NAME: &str = "rblndriver";

const MISSING_POLICY_MESSAGE: &str = "RBLNClusterPolicy not found in the cluster";

pub struct DriverReconciler {
    store: ClusterStoreRef,
    singleton: Arc<SingletonGuard>,
    config: ControllerConfig,
}

impl DriverReconciler {
    /// `singleton` must be the latch the policy controller claims on
    pub fn new(store: ClusterStoreRef, singleton: Arc<SingletonGuard>, config: ControllerConfig) -> Self {
        Self { store, singleton, config }
    }

    /// The latched cluster policy, if it still exists
    async fn authoritative_policy(&self) -> Result<Option<RBLNClusterPolicy>> {
        let Some(holder) = self.singleton.holder() else {
            return Ok(None);
        };
        let policies = self.store.list_cluster_policies().await?;
        Ok(policies.into_iter().find(|policy| policy.name_any() == holder))
    }

    /// Refetch the driver and write its status when `update` changed it
    async fn write_status<F>(&self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut RBLNDriverStatus) -> bool,
    {
        let current = match self.store.get_driver(name).await {
            Ok(Some(driver)) => driver,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(driver = %name, error = %e, "Skipping status write, refetch failed");
                return Ok(());
            }
        };
        let mut status = current.status.unwrap_or_default();
        if update(&mut status) {
            self.store.patch_driver_status(name, &status).await?;
        }
        Ok(())
    }

    async fn record_failure(&self, driver: &RBLNDriver, err: &Error) {
        let name = driver.name_any();
        let message = err.to_string();
        let generation = driver.metadata.generation;
        if let Err(status_err) = self
            .write_status(&name, |status| apply_driver_failure(status, &message, generation, Utc::now()))
            .await
        {
            warn!(driver = %name, error = %status_err, "Failed to record reconcile failure");
        }
    }

    #[instrument(skip(self, driver), fields(driver = %driver.name_any()))]
    pub async fn apply(&self, driver: &RBLNDriver) -> Result<Action> {
        let name = driver.name_any();
        let generation = driver.metadata.generation;

        let policy = match self.authoritative_policy().await {
            Ok(policy) => policy,
            Err(e) => {
                self.record_failure(driver, &e).await;
                return Err(e);
            }
        };
        let Some(policy) = policy.as_ref() else {
            info!("RBLNClusterPolicy not found yet, skipping driver reconcile");
            self.write_status(&name, |status| {
                apply_driver_not_ready(status, REASON_MISSING_CLUSTER_POLICY, MISSING_POLICY_MESSAGE, generation, Utc::now())
            })
            .await?;
            return Ok(Action::await_change());
        };

        if let Err(e) = validate_node_selector(self.store.as_ref(), driver).await {
            error!(error = %e, "nodeSelector validation failed");
            self.record_failure(driver, &e).await;
            return Err(e);
        }

        let result = match Scope::for_driver(
            self.store.clone(),
            driver,
            policy,
            self.config.operator_namespace.as_deref(),
            &self.config.cluster_info,
        ) {
            Ok(scope) => scope.patch_components().await.map(|_| scope),
            Err(e) => Err(e),
        };
        let scope = match result {
            Ok(scope) => scope,
            Err(e) => {
                self.record_failure(driver, &e).await;
                return Err(e);
            }
        };

        let readiness: Vec<_> = scope
            .assemble_component_conditions()
            .await
            .into_iter()
            .flat_map(|component| component.condition)
            .collect();
        self.write_status(&name, |status| apply_driver_readiness(status, &readiness, generation, Utc::now()))
            .await?;

        Ok(Action::requeue(self.config.resync))
    }
}

pub struct Context {
    reconciler: DriverReconciler,
    metrics: ReconcileMetrics,
    backoff: RetryBackoff,
}

impl Context {
    pub fn new(reconciler: DriverReconciler, metrics: ReconcileMetrics) -> Self {
        Self {
            reconciler,
            metrics,
            backoff: RetryBackoff::new(),
        }
    }
}

pub async fn reconcile(driver: Arc<RBLNDriver>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.start(CONTROLLER_NAME);
    info!(driver = %driver.name_any(), "Reconciling RBLNDriver");
    let action = ctx.reconciler.apply(&driver).await?;
    ctx.backoff.reset(&driver.name_any());
    Ok(action)
}

pub fn error_policy(driver: Arc<RBLNDriver>, err: &Error, ctx: Arc<Context>) -> Action {
    let name = driver.name_any();
    error!(driver = %name, error = %err, "RBLNDriver reconcile failed");
    ctx.metrics.failure(CONTROLLER_NAME, err);
    ctx.backoff.action_for(&name, err)
}

/// Every driver known to the controller's cache
fn all_drivers(store: &Store<RBLNDriver>) -> Vec<ObjectRef<RBLNDriver>> {
    store.state().iter().map(|driver| ObjectRef::from_obj(driver.as_ref())).collect()
}

pub async fn run(client: Client, ctx: Arc<Context>) {
    let drivers: Api<RBLNDriver> = Api::all(client.clone());
    let controller = Controller::new(drivers, watcher::Config::default());
    let store = controller.store();
    let policy_store = store.clone();
    let node_filter = Arc::new(NodeLabelFilter::new(""));

    info!(controller = CONTROLLER_NAME, "Starting controller");
    controller
        .watches(Api::<DaemonSet>::all(client.clone()), watcher::Config::default(), |ds| {
            owners_of::<RBLNDriver>(&ds.metadata)
        })
        .watches(
            Api::<RBLNClusterPolicy>::all(client.clone()),
            watcher::Config::default(),
            move |_| all_drivers(&policy_store),
        )
        .watches(Api::<Node>::all(client), watcher::Config::default(), move |node| {
            if node_filter.changed(&node) {
                all_drivers(&store)
            } else {
                Vec::new()
            }
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(driver = %object.name, "Reconciled"),
                Err(e) => warn!(error = %e, "Controller event failed"),
            }
        })
        .await;
    info!(controller = CONTROLLER_NAME, "Controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::cluster_info::ClusterInfo;
    use crate::crd::{
        find_condition, DriverState, RBLNClusterPolicySpec, RBLNDriverSpec, CONDITION_ERROR, CONDITION_READY,
        DRIVER_DEPLOY_LABEL, REASON_RECONCILE_FAILED,
    };
    use crate::domain::ObjectKind;
    use crate::error::ErrorAction;
    use crate::testing::{driver, node, policy, FakeCluster};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn npu_node(name: &str, extra: &[(&str, &str)]) -> Node {
        let mut labels = vec![
            (DRIVER_DEPLOY_LABEL, "true"),
            ("feature.node.kubernetes.io/system-os_release.ID", "ubuntu"),
            ("feature.node.kubernetes.io/system-os_release.VERSION_ID", "22.04"),
            ("feature.node.kubernetes.io/kernel-version.full", "5.15.0-100-generic"),
        ];
        labels.extend_from_slice(extra);
        node(name, &labels)
    }

    fn driver_spec() -> RBLNDriverSpec {
        serde_json::from_value(serde_json::json!({
            "version": "1.2.3",
            "manager": { "registry": "registry.example.com", "image": "rebellions/rbln-driver-manager", "version": "0.1.0" }
        }))
        .unwrap()
    }

    fn cluster_policy() -> RBLNClusterPolicy {
        policy_in("rbln-cluster-policy", "rbln-system")
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            operator_namespace: None,
            resync: Duration::from_secs(300),
            cluster_info: ClusterInfo::default(),
        }
    }

    fn policy_in(name: &str, namespace: &str) -> RBLNClusterPolicy {
        let spec: RBLNClusterPolicySpec = serde_json::from_value(serde_json::json!({ "namespace": namespace })).unwrap();
        policy(name, spec)
    }

    fn reconciler(cluster: Arc<FakeCluster>) -> DriverReconciler {
        let singleton = Arc::new(SingletonGuard::new());
        singleton.claim("rbln-cluster-policy");
        DriverReconciler::new(cluster, singleton, config())
    }

    #[tokio::test]
    async fn test_missing_policy_is_not_ready() {
        let d = driver("rbln-driver", driver_spec());
        let cluster = Arc::new(FakeCluster::default().with_driver(d.clone()));
        let action = reconciler(cluster.clone()).apply(&d).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = cluster.driver_status("rbln-driver").unwrap();
        assert_eq!(status.state, Some(DriverState::NotReady));
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_MISSING_CLUSTER_POLICY);
        assert_eq!(ready.message, MISSING_POLICY_MESSAGE);
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_selector_conflict_records_error_and_requeues() {
        let d = driver("rbln-driver", driver_spec());
        let other = driver(
            "other",
            RBLNDriverSpec {
                node_selector: [(DRIVER_DEPLOY_LABEL.to_string(), "true".to_string())].into(),
                ..Default::default()
            },
        );
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![npu_node("npu-0", &[])])
                .with_policy(cluster_policy())
                .with_driver(d.clone())
                .with_driver(other),
        );
        let err = reconciler(cluster.clone()).apply(&d).await.unwrap_err();
        assert_matches!(err, Error::NodeSelectorConflict(_));
        assert_matches!(err.action(), ErrorAction::RequeueAfter(delay) if delay == Duration::from_secs(60));

        let status = cluster.driver_status("rbln-driver").unwrap();
        let error = find_condition(&status.conditions, CONDITION_ERROR).unwrap();
        assert!(error.is_true());
        assert_eq!(error.reason, REASON_RECONCILE_FAILED);
        assert!(error.message.contains("\"other\""));
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_driver_pools_converge_and_report() {
        let d = driver("rbln-driver", driver_spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![npu_node("npu-0", &[])])
                .with_policy(cluster_policy())
                .with_driver(d.clone()),
        );
        let reconciler = reconciler(cluster.clone());
        let action = reconciler.apply(&d).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));

        let pools: Vec<_> = cluster
            .refs()
            .into_iter()
            .filter(|r| r.kind == ObjectKind::DaemonSet)
            .collect();
        assert_eq!(pools.len(), 1);
        let status = cluster.driver_status("rbln-driver").unwrap();
        assert_eq!(status.state, Some(DriverState::NotReady));

        cluster.set_daemonset_status("rbln-system", &pools[0].name, 1, 1, 0);
        reconciler.apply(&d).await.unwrap();
        let status = cluster.driver_status("rbln-driver").unwrap();
        assert_eq!(status.state, Some(DriverState::Ready));
        assert!(find_condition(&status.conditions, CONDITION_READY).unwrap().is_true());
        assert!(!find_condition(&status.conditions, CONDITION_ERROR).unwrap().is_true());
    }

    #[tokio::test]
    async fn test_no_selected_nodes_records_configuration_error() {
        let d = driver("rbln-driver", driver_spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_policy(cluster_policy())
                .with_driver(d.clone()),
        );
        let err = reconciler(cluster.clone()).apply(&d).await.unwrap_err();
        assert_matches!(err, Error::Configuration(_));
        let status = cluster.driver_status("rbln-driver").unwrap();
        assert!(find_condition(&status.conditions, CONDITION_ERROR).unwrap().is_true());
    }

    #[tokio::test]
    async fn test_unlatched_policy_is_treated_as_missing() {
        let d = driver("rbln-driver", driver_spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![npu_node("npu-0", &[])])
                .with_policy(cluster_policy())
                .with_driver(d.clone()),
        );
        let reconciler = DriverReconciler::new(cluster.clone(), Arc::new(SingletonGuard::new()), config());
        let action = reconciler.apply(&d).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = cluster.driver_status("rbln-driver").unwrap();
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, REASON_MISSING_CLUSTER_POLICY);
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_driver_follows_latched_policy() {
        let d = driver("rbln-driver", driver_spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![npu_node("npu-0", &[])])
                .with_policy(policy_in("alpha", "ignored-ns"))
                .with_policy(policy_in("zeta", "authoritative-ns"))
                .with_driver(d.clone()),
        );
        let singleton = Arc::new(SingletonGuard::new());
        singleton.claim("zeta");
        DriverReconciler::new(cluster.clone(), singleton, config())
            .apply(&d)
            .await
            .unwrap();

        let namespaces: Vec<_> = cluster
            .refs()
            .into_iter()
            .filter(|r| r.kind == ObjectKind::DaemonSet)
            .map(|r| r.namespace.unwrap_or_default())
            .collect();
        assert!(!namespaces.is_empty());
        assert!(namespaces.iter().all(|ns| ns == "authoritative-ns"));
    }

    #[tokio::test]
    async fn test_node_list_failure_is_returned_for_retry() {
        let d = driver("rbln-driver", driver_spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![npu_node("npu-0", &[])])
                .with_policy(cluster_policy())
                .with_driver(d.clone()),
        );
        cluster.fail_node_lists(true);
        let err = reconciler(cluster.clone()).apply(&d).await.unwrap_err();
        assert_matches!(err, Error::Internal(_));
        assert_matches!(err.action(), ErrorAction::RequeueWithBackoff);

        let status = cluster.driver_status("rbln-driver").unwrap();
        assert!(find_condition(&status.conditions, CONDITION_ERROR).unwrap().is_true());
        assert_eq!(cluster.object_count(), 0);
    }
}
