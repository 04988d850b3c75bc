//! Watch event filtering shared by the controllers

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Remembers the last labels seen per node and reports real changes.
///
/// Only labels starting with `prefix` are compared; an empty prefix compares
/// every label. A node seen for the first time counts as changed.
#[derive(Debug)]
pub struct NodeLabelFilter {
    prefix: &'static str,
    seen: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl NodeLabelFilter {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn relevant(&self, node: &Node) -> BTreeMap<String, String> {
        node.metadata
            .labels
            .iter()
            .flatten()
            .filter(|(key, _)| key.starts_with(self.prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Record the node's labels; true when they differ from the last sighting
    pub fn changed(&self, node: &Node) -> bool {
        let name = node.metadata.name.clone().unwrap_or_default();
        let labels = self.relevant(node);
        let mut seen = self.seen.lock();
        if seen.get(&name) == Some(&labels) {
            return false;
        }
        debug!(node = %name, prefix = %self.prefix, "Node labels changed");
        seen.insert(name, labels);
        true
    }

    /// Drop the record of a node so its next sighting triggers again
    pub fn forget(&self, name: &str) {
        self.seen.lock().remove(name);
    }
}

/// References to every owner of `meta` whose kind is `K`
pub fn owners_of<K>(meta: &ObjectMeta) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    let group = K::group(&());
    meta.owner_references
        .iter()
        .flatten()
        .filter(|owner| owner.kind == kind && owner.api_version.starts_with(&*group))
        .map(|owner| ObjectRef::new(&owner.name))
        .collect()
}
