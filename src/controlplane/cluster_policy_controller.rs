//! RBLNClusterPolicy controller
//!
//! ```text
//! event ─► finalizer ─► latch ─► scope ─► node labels ─► components ─► status
//!              │
//!              └─ cleanup: release latch
//! ```
//!
//! Only the latched policy drives components. Every other policy is marked
//! `ignored` and left alone until the latched one is deleted.

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::RetryBackoff;
use super::metrics::ReconcileMetrics;
use super::node_labeler::label_npu_nodes;
use super::scope::Scope;
use super::singleton::{Claim, SingletonGuard};
use super::status::{apply_policy_failure, apply_policy_rollup};
use super::watch::{owners_of, NodeLabelFilter};
use super::ControllerConfig;
use crate::crd::{ClusterState, RBLNClusterPolicy, RBLNClusterPolicyStatus};
use crate::domain::ClusterStoreRef;
use crate::error::{Error, Result};

pub const CONTROLLER_NAME: &str = "rblnclusterpolicy";
pub const POLICY_FINALIZER: &str = "rebellions.ai/cluster-policy-finalizer";

const NFD_MISSING_REQUEUE: Duration = Duration::from_secs(30);
const NODE_LABEL_PREFIX: &str = "rebellions.ai/";

/// Reconcile logic for cluster policies, independent of the watch plumbing
pub struct PolicyReconciler {
    store: ClusterStoreRef,
    singleton: Arc<SingletonGuard>,
    config: ControllerConfig,
}

impl PolicyReconciler {
    pub fn new(store: ClusterStoreRef, singleton: Arc<SingletonGuard>, config: ControllerConfig) -> Self {
        Self {
            store,
            singleton,
            config,
        }
    }

    pub fn singleton(&self) -> &Arc<SingletonGuard> {
        &self.singleton
    }

    /// Refetch the policy and write its status when `update` changed it.
    ///
    /// Nothing is written when the refetch fails or the policy is gone.
    async fn write_status<F>(&self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut RBLNClusterPolicyStatus) -> bool,
    {
        let current = match self.store.get_cluster_policy(name).await {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                debug!(policy = %name, "Policy disappeared before status write");
                return Ok(());
            }
            Err(e) => {
                warn!(policy = %name, error = %e, "Skipping status write, refetch failed");
                return Ok(());
            }
        };
        let mut status = current.status.unwrap_or_default();
        if update(&mut status) {
            self.store.patch_cluster_policy_status(name, &status).await?;
        }
        Ok(())
    }

    /// Record a failure in status, then hand the error back
    async fn fail(&self, policy: &RBLNClusterPolicy, err: Error) -> Error {
        let name = policy.name_any();
        let message = err.to_string();
        let generation = policy.metadata.generation;
        if let Err(status_err) = self
            .write_status(&name, |status| apply_policy_failure(status, &message, generation, Utc::now()))
            .await
        {
            warn!(policy = %name, error = %status_err, "Failed to record reconcile failure");
        }
        err
    }

    async fn set_state(&self, name: &str, state: ClusterState) -> Result<()> {
        self.write_status(name, |status| status.set_state(state)).await
    }

    #[instrument(skip(self, policy), fields(policy = %policy.name_any()))]
    pub async fn apply(&self, policy: &RBLNClusterPolicy) -> Result<Action> {
        let name = policy.name_any();
        if let Claim::Ignored { holder } = self.singleton.claim(&name) {
            info!(holder = %holder, "Another RBLNClusterPolicy is authoritative, ignoring");
            self.set_state(&name, ClusterState::Ignored).await?;
            return Ok(Action::await_change());
        }

        let scope = match Scope::for_cluster_policy(
            self.store.clone(),
            policy,
            self.config.operator_namespace.as_deref(),
            &self.config.cluster_info,
        ) {
            Ok(scope) => scope,
            Err(e) => return Err(self.fail(policy, e).await),
        };

        let report = match label_npu_nodes(self.store.as_ref(), policy.spec.workload_type).await {
            Ok(report) => report,
            Err(e) => return Err(self.fail(policy, e).await),
        };
        if !report.nfd_installed {
            warn!("node-feature-discovery labels not found, requeueing");
            self.set_state(&name, ClusterState::NotReady).await?;
            return Ok(Action::requeue(NFD_MISSING_REQUEUE));
        }
        if report.npu_nodes == 0 {
            info!("No Rebellions NPU nodes found");
            self.set_state(&name, ClusterState::NotReady).await?;
            return Ok(Action::await_change());
        }
        debug!(npu_nodes = report.npu_nodes, "Labeled NPU nodes");

        scope.patch_components().await?;

        let components = scope.assemble_component_conditions().await;
        let generation = policy.metadata.generation;
        self.write_status(&name, |status| {
            let before = status.clone();
            apply_policy_rollup(status, components, generation, Utc::now());
            *status != before
        })
        .await?;

        Ok(Action::requeue(self.config.resync))
    }

    #[instrument(skip(self, policy), fields(policy = %policy.name_any()))]
    pub async fn cleanup(&self, policy: &RBLNClusterPolicy) -> Result<Action> {
        if self.singleton.release(&policy.name_any()) {
            info!("Authoritative RBLNClusterPolicy deleted");
        }
        Ok(Action::await_change())
    }
}

/// Shared state handed to every reconcile call
pub struct Context {
    client: Client,
    reconciler: PolicyReconciler,
    metrics: ReconcileMetrics,
    backoff: RetryBackoff,
}

impl Context {
    pub fn new(client: Client, reconciler: PolicyReconciler, metrics: ReconcileMetrics) -> Self {
        Self {
            client,
            reconciler,
            metrics,
            backoff: RetryBackoff::new(),
        }
    }
}

pub async fn reconcile(policy: Arc<RBLNClusterPolicy>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.start(CONTROLLER_NAME);
    let name = policy.name_any();
    info!(policy = %name, "Reconciling RBLNClusterPolicy");

    let api: Api<RBLNClusterPolicy> = Api::all(ctx.client.clone());
    let reconciler = &ctx.reconciler;
    let action = finalizer(&api, POLICY_FINALIZER, policy, |event| async move {
        match event {
            FinalizerEvent::Apply(policy) => reconciler.apply(&policy).await,
            FinalizerEvent::Cleanup(policy) => reconciler.cleanup(&policy).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))?;

    ctx.backoff.reset(&name);
    Ok(action)
}

pub fn error_policy(policy: Arc<RBLNClusterPolicy>, err: &Error, ctx: Arc<Context>) -> Action {
    let name = policy.name_any();
    error!(policy = %name, error = %err, "RBLNClusterPolicy reconcile failed");
    ctx.metrics.failure(CONTROLLER_NAME, err);
    ctx.backoff.action_for(&name, err)
}

/// Map a node event to the latched policy when its `rebellions.ai/` labels changed
fn node_mapper(
    singleton: Arc<SingletonGuard>,
    filter: Arc<NodeLabelFilter>,
) -> impl Fn(Node) -> Option<ObjectRef<RBLNClusterPolicy>> + Send + Sync + 'static {
    move |node| {
        if node.metadata.deletion_timestamp.is_some() {
            filter.forget(&node.name_any());
            return singleton.holder().map(|name| ObjectRef::new(&name));
        }
        if !filter.changed(&node) {
            return None;
        }
        let holder = singleton.holder()?;
        debug!(node = %node.name_any(), policy = %holder, "Rebellions node labels changed");
        Some(ObjectRef::new(&holder))
    }
}

/// Run the controller until shutdown
pub async fn run(client: Client, ctx: Arc<Context>) {
    let policies: Api<RBLNClusterPolicy> = Api::all(client.clone());
    let singleton = ctx.reconciler.singleton().clone();
    let filter = Arc::new(NodeLabelFilter::new(NODE_LABEL_PREFIX));

    info!(controller = CONTROLLER_NAME, "Starting controller");
    Controller::new(policies, watcher::Config::default())
        .watches(Api::<DaemonSet>::all(client.clone()), watcher::Config::default(), |ds| {
            owners_of::<RBLNClusterPolicy>(&ds.metadata)
        })
        .watches(Api::<ConfigMap>::all(client.clone()), watcher::Config::default(), |cm| {
            owners_of::<RBLNClusterPolicy>(&cm.metadata)
        })
        .watches(Api::<Service>::all(client.clone()), watcher::Config::default(), |svc| {
            owners_of::<RBLNClusterPolicy>(&svc.metadata)
        })
        .watches(
            Api::<Node>::all(client),
            watcher::Config::default(),
            node_mapper(singleton, filter),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(policy = %object.name, "Reconciled"),
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
    use crate::controlplane::node_labeler::NPU_PRESENT_LABEL;
    use crate::crd::{find_condition, RBLNClusterPolicySpec, CONDITION_ERROR, CONDITION_READY, REASON_RECONCILE_FAILED};
    use crate::testing::{node, policy, FakeCluster};
    use assert_matches::assert_matches;

    const PCI: &str = "feature.node.kubernetes.io/pci-1eff.present";

    fn spec() -> RBLNClusterPolicySpec {
        serde_json::from_value(serde_json::json!({
            "namespace": "rbln-system",
            "devicePlugin": { "version": "0.2.0" }
        }))
        .unwrap()
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            operator_namespace: None,
            resync: Duration::from_secs(300),
            cluster_info: ClusterInfo::default(),
        }
    }

    fn reconciler(cluster: Arc<FakeCluster>) -> PolicyReconciler {
        PolicyReconciler::new(cluster, Arc::new(SingletonGuard::new()), config())
    }

    #[tokio::test]
    async fn test_second_policy_is_ignored() {
        let first = policy("first", spec());
        let second = policy("second", spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![node("npu-0", &[(PCI, "true")])])
                .with_policy(first.clone())
                .with_policy(second.clone()),
        );
        let reconciler = reconciler(cluster.clone());

        reconciler.singleton().claim("first");
        let action = reconciler.apply(&second).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cluster.policy_status("second").unwrap().state, Some(ClusterState::Ignored));
        assert_eq!(cluster.object_count(), 0);
        assert_eq!(cluster.node_patch_count(), 0);
    }

    #[tokio::test]
    async fn test_deleting_the_holder_frees_the_latch() {
        let first = policy("first", spec());
        let cluster = Arc::new(FakeCluster::default().with_policy(first.clone()));
        let reconciler = reconciler(cluster);

        reconciler.singleton().claim("first");
        reconciler.cleanup(&first).await.unwrap();
        assert_eq!(reconciler.singleton().holder(), None);
    }

    #[tokio::test]
    async fn test_missing_feature_discovery_requeues() {
        let p = policy("rbln-cluster-policy", spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![node("cpu-0", &[("kubernetes.io/os", "linux")])])
                .with_policy(p.clone()),
        );
        let action = reconciler(cluster.clone()).apply(&p).await.unwrap();
        assert_eq!(action, Action::requeue(NFD_MISSING_REQUEUE));
        assert_eq!(
            cluster.policy_status("rbln-cluster-policy").unwrap().state,
            Some(ClusterState::NotReady)
        );
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_no_npu_nodes_stops_before_components() {
        let p = policy("rbln-cluster-policy", spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![node("cpu-0", &[("feature.node.kubernetes.io/cpu-model.id", "85")])])
                .with_policy(p.clone()),
        );
        let action = reconciler(cluster.clone()).apply(&p).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cluster.object_count(), 0);
    }

    #[tokio::test]
    async fn test_rollup_is_written_after_patching() {
        let p = policy("rbln-cluster-policy", spec());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![node("npu-0", &[(PCI, "true")])])
                .with_policy(p.clone()),
        );
        let reconciler = reconciler(cluster.clone());
        let action = reconciler.apply(&p).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));
        assert_eq!(cluster.node_labels("npu-0")[NPU_PRESENT_LABEL], "true");
        assert!(cluster.daemonset("rbln-system", "rbln-device-plugin").is_some());

        let status = cluster.policy_status("rbln-cluster-policy").unwrap();
        assert_eq!(status.state, Some(ClusterState::NotReady));
        assert_eq!(status.components.len(), 1);
        let ready = find_condition(&status.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.message, "Components not ready: rbln-system/rbln-device-plugin");

        cluster.set_daemonset_status("rbln-system", "rbln-device-plugin", 1, 1, 0);
        reconciler.apply(&p).await.unwrap();
        let status = cluster.policy_status("rbln-cluster-policy").unwrap();
        assert_eq!(status.state, Some(ClusterState::Ready));

        // A converged pass does not rewrite the status
        let writes = cluster.policy_status_writes();
        reconciler.apply(&p).await.unwrap();
        assert_eq!(cluster.policy_status_writes(), writes);
    }

    #[tokio::test]
    async fn test_missing_namespace_records_error() {
        let p = policy("rbln-cluster-policy", RBLNClusterPolicySpec::default());
        let cluster = Arc::new(
            FakeCluster::default()
                .with_nodes(vec![node("npu-0", &[(PCI, "true")])])
                .with_policy(p.clone()),
        );
        let err = reconciler(cluster.clone()).apply(&p).await.unwrap_err();
        assert_matches!(err, Error::Configuration(_));

        let status = cluster.policy_status("rbln-cluster-policy").unwrap();
        assert_eq!(status.state, Some(ClusterState::NotReady));
        let error = find_condition(&status.conditions, CONDITION_ERROR).unwrap();
        assert!(error.is_true());
        assert_eq!(error.reason, REASON_RECONCILE_FAILED);
        assert!(error.message.contains("OPERATOR_NAMESPACE"));
        assert!(!find_condition(&status.conditions, CONDITION_READY).unwrap().is_true());
    }

    #[tokio::test]
    async fn test_failed_refetch_skips_status_write() {
        let p = policy("rbln-cluster-policy", RBLNClusterPolicySpec::default());
        let cluster = Arc::new(FakeCluster::default().with_policy(p.clone()));
        cluster.fail_policy_reads(true);
        reconciler(cluster.clone()).apply(&p).await.unwrap_err();
        assert_eq!(cluster.policy_status_writes(), 0);
    }

    #[test]
    fn test_node_mapper_targets_the_holder() {
        let singleton = Arc::new(SingletonGuard::new());
        let mapper = node_mapper(singleton.clone(), Arc::new(NodeLabelFilter::new(NODE_LABEL_PREFIX)));

        // Nothing latched yet
        assert_eq!(mapper(node("n1", &[(NPU_PRESENT_LABEL, "true")])), None);

        singleton.claim("rbln-cluster-policy");
        assert_eq!(
            mapper(node("n2", &[(NPU_PRESENT_LABEL, "true")])),
            Some(ObjectRef::new("rbln-cluster-policy"))
        );
        assert_eq!(mapper(node("n2", &[(NPU_PRESENT_LABEL, "true"), ("zone", "a")])), None);
    }
}
