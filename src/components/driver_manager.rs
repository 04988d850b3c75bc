//! Driver manager
//!
//! Installs the kernel driver from precompiled images. Nodes are grouped
//! into pools by OS and kernel, and every pool gets its own DaemonSet
//! `rbln-driver-{pool}` running the image built for that combination.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Affinity, Container, ExecAction, PodSpec, Probe, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use super::builders::{self, DaemonSetBuilder, VALIDATIONS_PATH, VALIDATIONS_VOLUME};
use super::image::{compose_image_reference, tagged_image};
use super::node_pool::{self, NodePool};
use super::validator::HOST_ROOT_VOLUME;
use super::{apply_objects, delete_objects, ComponentContext, RBLN_DRIVER};
use super::readiness::daemonset_ready;
use crate::crd::{
    Condition, ConditionStatus, RBLNDriver, RBLNDriverSpec, CONDITION_DAEMONSET_READY, DRIVER_DEPLOY_LABEL,
    REASON_DAEMONSET_ALL_PODS_READY, REASON_DAEMONSET_NOT_FOUND, REASON_DAEMONSET_PODS_NOT_READY,
};
use crate::domain::{ComponentPatcher, ManagedObject, ObjectKind, ObjectRef};
use crate::error::{Error, Result};

pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const NODE_POOL_LABEL: &str = "nodepool";

const MANAGER_CONTAINER: &str = "k8s-driver-manager";
const DEFAULT_MANAGER_IMAGE: &str = "rebellions/rbln-driver-manager";
const DRIVER_CONTAINER: &str = "rbln-driver-container";
const INSTALLER_COMMAND: &str = "/opt/rebellions/bin/rbln-driver";
const HOST_DRIVER_VOLUME: &str = "host-driver";
const HOST_DRIVER_PATH: &str = "/run/rbln/driver";
const STARTUP_PROBE_KEY: &str = "startup-probe.sh";
const STARTUP_PROBE_PATH: &str = "/usr/local/bin/rbln-startup-probe.sh";
const READY_MARKER: &str = ".driver-ctr-ready";

const STARTUP_PROBE: &str = r#"#!/bin/sh
set -eu

VALIDATIONS_DIR="/run/rbln/validations"
READY_FILE="${VALIDATIONS_DIR}/.driver-ctr-ready"

mkdir -p "${VALIDATIONS_DIR}"

if [ ! -f /sys/module/rebellions/refcnt ]; then
  echo "Rebellions kernel module not loaded"
  exit 1
fi

if ! command -v rbln-smi >/dev/null 2>&1; then
  echo "rbln-smi not found"
  exit 1
fi

if ! rbln-smi; then
  echo "rbln-smi failed"
  exit 1
fi

TMP_FILE="${READY_FILE}.tmp"
: > "$TMP_FILE"
mv "$TMP_FILE" "$READY_FILE"
"#;

/// Host entitlement directories mounted for RHEL-family builds, as
/// (container path, host path), sorted by container path
fn subscription_mounts(distribution: &str) -> Option<&'static [(&'static str, &'static str)]> {
    match distribution {
        "rhel" => Some(&[("/etc/pki/entitlement", "/etc/pki/entitlement"), ("/etc/rhsm", "/etc/rhsm")]),
        "rhcos" => Some(&[
            ("/var/run/secrets/etc-pki-entitlement", "/etc/pki/entitlement"),
            ("/var/run/secrets/rhsm", "/etc/rhsm"),
        ]),
        _ => None,
    }
}

pub struct DriverManager {
    ctx: ComponentContext,
    spec: Option<RBLNDriverSpec>,
    node_selector: BTreeMap<String, String>,
}

impl DriverManager {
    pub fn new(ctx: ComponentContext, driver: &RBLNDriver) -> Self {
        Self {
            node_selector: driver.node_selector(),
            spec: Some(driver.spec.clone()),
            ctx,
        }
    }

    fn startup_probe_name() -> String {
        format!("{}-startup-probe", RBLN_DRIVER)
    }

    fn component_labels() -> BTreeMap<String, String> {
        BTreeMap::from([(COMPONENT_LABEL.to_string(), RBLN_DRIVER.to_string())])
    }

    fn shared_objects(&self, owner: &OwnerReference) -> Vec<ManagedObject> {
        let namespace = &self.ctx.namespace;
        let mut objects = self.ctx.service_account_objects(RBLN_DRIVER, owner);
        objects.push(builders::cluster_role(
            RBLN_DRIVER,
            vec![builders::rule(&[""], &["nodes"], &["get", "list", "watch", "patch", "update"])],
            owner,
        ));
        objects.push(builders::cluster_role_binding(RBLN_DRIVER, RBLN_DRIVER, RBLN_DRIVER, namespace, owner));
        objects.push(builders::config_map(
            &Self::startup_probe_name(),
            namespace,
            BTreeMap::from([(STARTUP_PROBE_KEY.to_string(), STARTUP_PROBE.to_string())]),
            owner,
        ));
        objects
    }

    fn manager_container(spec: &RBLNDriverSpec) -> Container {
        let manager = &spec.manager;
        let reference = compose_image_reference(
            manager.registry.as_deref().unwrap_or_default(),
            manager
                .image
                .as_deref()
                .filter(|image| !image.is_empty())
                .unwrap_or(DEFAULT_MANAGER_IMAGE),
        );
        let pull_policy = manager.image_pull_policy.as_deref().unwrap_or("IfNotPresent");
        let (image, pull_policy) = tagged_image(&reference, manager.version.as_deref(), pull_policy);

        let mut env = vec![builders::env_field("NODE_NAME", "spec.nodeName")];
        env.extend(manager.env.iter().map(|e| builders::env_value(&e.name, &e.value)));

        Container {
            name: MANAGER_CONTAINER.to_string(),
            image: Some(image),
            image_pull_policy: Some(pull_policy),
            command: builders::strings(&["driver-manager"]),
            args: builders::strings(&["sync_driver_label"]),
            env: Some(env),
            security_context: builders::privileged(),
            volume_mounts: Some(vec![VolumeMount {
                read_only: Some(true),
                ..builders::propagated_mount(HOST_ROOT_VOLUME, "/host", "HostToContainer")
            }]),
            ..Default::default()
        }
    }

    fn subscription_distribution(&self, pool: &NodePool) -> Option<&'static str> {
        if self.ctx.is_openshift() {
            Some("rhcos")
        } else if pool.os_release == "rhel" {
            Some("rhel")
        } else {
            None
        }
    }

    fn driver_container(&self, spec: &RBLNDriverSpec, pool: &NodePool) -> Result<(Container, Vec<Volume>)> {
        let image = spec.precompiled_image_path(&pool.os(), &pool.kernel)?;
        let pull_policy = spec
            .image_pull_policy
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "IfNotPresent".to_string());
        let args = if spec.args.is_empty() {
            vec!["init".to_string()]
        } else {
            spec.args.clone()
        };

        let mut mounts = vec![
            builders::propagated_mount(HOST_DRIVER_VOLUME, "/host/run/rbln/driver", "Bidirectional"),
            builders::mount(VALIDATIONS_VOLUME, VALIDATIONS_PATH),
            builders::sub_path_mount(&Self::startup_probe_name(), STARTUP_PROBE_PATH, STARTUP_PROBE_KEY),
        ];
        let mut volumes = Vec::new();
        if let Some(distribution) = self.subscription_distribution(pool) {
            info!(os = distribution, pool = %pool.name, "Mounting subscription entitlements into driver container");
            for (i, (mount_path, host_path)) in subscription_mounts(distribution).unwrap_or_default().iter().enumerate() {
                let name = format!("subscription-config-{}", i);
                mounts.push(builders::read_only_mount(&name, mount_path));
                volumes.push(builders::host_path_volume(&name, host_path, Some("Directory")));
            }
        }

        let container = Container {
            name: DRIVER_CONTAINER.to_string(),
            image: Some(image),
            image_pull_policy: Some(pull_policy),
            command: builders::strings(&[INSTALLER_COMMAND]),
            args: Some(args),
            env: Some(spec.env.clone()).filter(|env| !env.is_empty()),
            resources: Some(builders::requests_with_defaults(
                spec.resources.as_ref(),
                builders::DEFAULT_CPU_REQUEST,
                builders::DEFAULT_MEMORY_REQUEST,
            )),
            lifecycle: builders::pre_stop(&["/bin/sh", "-c", &format!("rm -f {}/{}", VALIDATIONS_PATH, READY_MARKER)]),
            security_context: builders::privileged(),
            volume_mounts: Some(mounts),
            startup_probe: Some(Probe {
                exec: Some(ExecAction {
                    command: builders::strings(&["/bin/sh", "-c", STARTUP_PROBE_PATH]),
                }),
                timeout_seconds: Some(60),
                period_seconds: Some(10),
                failure_threshold: Some(120),
                ..Default::default()
            }),
            ..Default::default()
        };
        Ok((container, volumes))
    }

    fn pool_daemonset(&self, spec: &RBLNDriverSpec, pool: &NodePool, owner: &OwnerReference) -> Result<ManagedObject> {
        let (driver_container, extra_volumes) = self.driver_container(spec, pool)?;

        let mut node_selector = pool.node_selector.clone();
        node_selector.insert(DRIVER_DEPLOY_LABEL.to_string(), "true".to_string());

        let mut volumes = vec![
            builders::host_path_volume(HOST_DRIVER_VOLUME, HOST_DRIVER_PATH, Some("DirectoryOrCreate")),
            builders::empty_dir_volume(VALIDATIONS_VOLUME),
            builders::host_path_volume(HOST_ROOT_VOLUME, "/", Some("Directory")),
            builders::config_map_volume(
                &Self::startup_probe_name(),
                &Self::startup_probe_name(),
                STARTUP_PROBE_KEY,
                Some(0o755),
                None,
            ),
        ];
        volumes.extend(extra_volumes);

        let pod_spec = PodSpec {
            service_account_name: Some(RBLN_DRIVER.to_string()),
            node_selector: Some(node_selector),
            affinity: spec.node_affinity.clone().map(|node_affinity| Affinity {
                node_affinity: Some(node_affinity),
                ..Default::default()
            }),
            tolerations: Some(spec.tolerations.clone()).filter(|t| !t.is_empty()),
            image_pull_secrets: builders::image_pull_secrets(&spec.image_pull_secrets),
            priority_class_name: Some(spec.priority_class_name.clone()).filter(|p| !p.is_empty()),
            init_containers: Some(vec![Self::manager_container(spec)]),
            containers: vec![driver_container],
            volumes: Some(volumes),
            ..Default::default()
        };

        let mut selector_labels = Self::component_labels();
        selector_labels.insert(NODE_POOL_LABEL.to_string(), pool.name.clone());

        Ok(DaemonSetBuilder::new(&format!("{}-{}", RBLN_DRIVER, pool.name), &self.ctx.namespace, owner)
            .selector_labels(selector_labels)
            .labels(&spec.labels)
            .annotations(&spec.annotations)
            .pod_spec(pod_spec)
            .rolling_update()
            .build())
    }

    /// Delete pool DaemonSets of `owner` whose pool no longer has nodes
    async fn prune_stale_pools(&self, desired: &BTreeSet<String>, owner: &OwnerReference) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let existing = store
            .list_daemonsets(&self.ctx.namespace, &Self::component_labels())
            .await
            .map_err(|e| Error::patch(RBLN_DRIVER, e))?;
        let stale: Vec<ObjectRef> = existing
            .iter()
            .filter(|ds| {
                ds.metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == owner.uid))
            })
            .filter_map(|ds| ds.metadata.name.clone())
            .filter(|name| !desired.contains(name))
            .map(|name| self.ctx.namespaced(ObjectKind::DaemonSet, name))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }
        info!(component = RBLN_DRIVER, count = stale.len(), "Removing DaemonSets of empty node pools");
        delete_objects(store, RBLN_DRIVER, &stale).await
    }

    fn readiness_condition(&self, daemonsets: &[k8s_openapi::api::apps::v1::DaemonSet]) -> Condition {
        let namespace = &self.ctx.namespace;
        if daemonsets.is_empty() {
            return Condition::new(
                CONDITION_DAEMONSET_READY,
                ConditionStatus::False,
                REASON_DAEMONSET_NOT_FOUND,
                format!("DaemonSet {}/{} could not be found", namespace, RBLN_DRIVER),
            );
        }

        let not_ready: Vec<String> = daemonsets
            .iter()
            .filter(|ds| !daemonset_ready(ds))
            .map(|ds| {
                format!(
                    "{}/{}",
                    ds.metadata.namespace.as_deref().unwrap_or(namespace),
                    ds.metadata.name.as_deref().unwrap_or_default()
                )
            })
            .collect();
        if not_ready.is_empty() {
            Condition::new(
                CONDITION_DAEMONSET_READY,
                ConditionStatus::True,
                REASON_DAEMONSET_ALL_PODS_READY,
                format!("All pods in DaemonSets for {} are running", RBLN_DRIVER),
            )
        } else {
            Condition::new(
                CONDITION_DAEMONSET_READY,
                ConditionStatus::False,
                REASON_DAEMONSET_PODS_NOT_READY,
                format!("DaemonSets not ready: {}", not_ready.join(", ")),
            )
        }
    }
}

#[async_trait]
impl ComponentPatcher for DriverManager {
    fn name(&self) -> &str {
        RBLN_DRIVER
    }

    fn namespace(&self) -> &str {
        &self.ctx.namespace
    }

    fn is_enabled(&self) -> bool {
        self.spec.is_some()
    }

    async fn converge(&self, owner: &OwnerReference) -> Result<()> {
        let Some(spec) = &self.spec else {
            return Ok(());
        };
        let store = self.ctx.store.as_ref();
        apply_objects(store, RBLN_DRIVER, self.shared_objects(owner)).await?;

        let pools = node_pool::node_pools(store, &self.node_selector).await?;
        if pools.is_empty() {
            return Err(Error::Configuration(format!(
                "no nodes matching the given selector for {}",
                RBLN_DRIVER
            )));
        }

        let daemonsets = pools
            .iter()
            .map(|pool| self.pool_daemonset(spec, pool, owner))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| Error::patch(RBLN_DRIVER, e))?;
        let desired: BTreeSet<String> = daemonsets.iter().map(|ds| ds.object_ref().name).collect();
        apply_objects(store, RBLN_DRIVER, daemonsets).await?;
        self.prune_stale_pools(&desired, owner).await
    }

    async fn tear_down(&self, _owner: &OwnerReference) -> Result<()> {
        warn!(component = RBLN_DRIVER, "Driver manager is disabled, removing its resources");
        let store = self.ctx.store.as_ref();
        let daemonsets = store
            .list_daemonsets(&self.ctx.namespace, &Self::component_labels())
            .await
            .map_err(|e| Error::clean_up(RBLN_DRIVER, e))?;

        let mut refs: Vec<ObjectRef> = daemonsets
            .iter()
            .filter_map(|ds| ds.metadata.name.clone())
            .map(|name| self.ctx.namespaced(ObjectKind::DaemonSet, name))
            .collect();
        refs.push(ObjectRef::cluster(ObjectKind::ClusterRoleBinding, RBLN_DRIVER));
        refs.push(ObjectRef::cluster(ObjectKind::ClusterRole, RBLN_DRIVER));
        refs.push(self.ctx.namespaced(ObjectKind::ConfigMap, Self::startup_probe_name()));
        refs.extend(self.ctx.service_account_refs(RBLN_DRIVER));
        delete_objects(store, RBLN_DRIVER, &refs).await
    }

    async fn readiness_report(&self, _owner: &OwnerReference) -> Vec<Condition> {
        let condition = match self
            .ctx
            .store
            .list_daemonsets(&self.ctx.namespace, &Self::component_labels())
            .await
        {
            Ok(daemonsets) => self.readiness_condition(&daemonsets),
            Err(e) => Condition::new(
                CONDITION_DAEMONSET_READY,
                ConditionStatus::False,
                REASON_DAEMONSET_NOT_FOUND,
                format!("DaemonSet list could not be retrieved: {}", e),
            ),
        };
        vec![condition]
    }
}
