//! Parent configuration snapshots and their store.
//!
//! A `ParentConfig` captures the topology context of one upstream
//! virtual network: the routing tier and transport zone its segments
//! attach to, the segment paths themselves, and the IP blocks child
//! subnets are carved from. Snapshots are compared by value so an
//! unchanged virtual network never triggers a reconciliation cascade.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::debug;

/// Topology snapshot for one upstream virtual network.
#[derive(Debug, Clone, Default)]
pub struct ParentConfig {
    /// Owning VirtualNetwork UID
    pub id: String,
    /// Owning VirtualNetwork name
    pub name: String,
    /// Owning VirtualNetwork namespace
    pub namespace: String,
    /// Routing tier the parent segments attach to
    pub tier1_path: String,
    /// Transport zone of the parent segments
    pub transport_zone_path: String,
    /// Paths of every segment tagged with the virtual network
    pub segment_paths: BTreeSet<String>,
    /// Block public child subnets are carved from
    pub public_ip_block_path: String,
    /// Block private child subnets are carved from
    pub private_ip_block_path: String,
    /// Tombstone flag
    pub marked_for_delete: bool,
}

impl ParentConfig {
    /// `namespace/name` key used by the namespaced-name index.
    pub fn namespaced_name(&self) -> String {
        namespaced_name(&self.namespace, &self.name)
    }

    /// Point both block paths at the same shared block.
    pub fn set_ip_block_paths(&mut self, private_path: &str, public_path: &str) {
        self.private_ip_block_path = private_path.to_string();
        self.public_ip_block_path = public_path.to_string();
    }

    /// Value equality over every field a resolver run can produce.
    /// Segment paths compare as sets, so discovery order is
    /// irrelevant.
    pub fn same_as(&self, other: &ParentConfig) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.namespace == other.namespace
            && self.tier1_path == other.tier1_path
            && self.transport_zone_path == other.transport_zone_path
            && self.public_ip_block_path == other.public_ip_block_path
            && self.private_ip_block_path == other.private_ip_block_path
            && self.segment_paths == other.segment_paths
    }
}

/// `namespace/name` key for the namespaced-name index.
pub fn namespaced_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, ParentConfig>,
    by_namespaced_name: HashMap<String, String>,
}

/// Store of parent configurations keyed by virtual-network UID, with
/// a namespaced-name lookup for child subnets referencing their
/// parent by name.
#[derive(Debug, Default)]
pub struct ParentConfigStore {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("configs", &self.by_id.len())
            .finish()
    }
}

impl ParentConfigStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert or remove each config based on its tombstone flag.
    pub fn apply(&self, configs: impl IntoIterator<Item = ParentConfig>) {
        let mut inner = self.write();
        for config in configs {
            if config.marked_for_delete {
                debug!(id = config.id, "Removing parent config from store");
                if let Some(previous) = inner.by_id.remove(&config.id) {
                    inner.by_namespaced_name.remove(&previous.namespaced_name());
                }
            } else {
                debug!(id = config.id, "Adding parent config to store");
                if let Some(previous) = inner.by_id.get(&config.id) {
                    let previous_key = previous.namespaced_name();
                    inner.by_namespaced_name.remove(&previous_key);
                }
                inner
                    .by_namespaced_name
                    .insert(config.namespaced_name(), config.id.clone());
                inner.by_id.insert(config.id.clone(), config);
            }
        }
    }

    /// Look up by virtual-network UID.
    pub fn get(&self, id: &str) -> Option<ParentConfig> {
        self.read().by_id.get(id).cloned()
    }

    /// All stored configs.
    pub fn list(&self) -> Vec<ParentConfig> {
        self.read().by_id.values().cloned().collect()
    }

    /// Look up by the `namespace/name` of the owning virtual network.
    pub fn get_by_namespace_name(&self, namespace: &str, name: &str) -> Option<ParentConfig> {
        let inner = self.read();
        inner
            .by_namespaced_name
            .get(&namespaced_name(namespace, name))
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    #[allow(clippy::unwrap_used, reason = "store lock is never poisoned: no panics under it")]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap()
    }

    #[allow(clippy::unwrap_used, reason = "store lock is never poisoned: no panics under it")]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str, namespace: &str, name: &str) -> ParentConfig {
        ParentConfig {
            id: id.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            tier1_path: "/infra/tier-1s/t1".to_string(),
            transport_zone_path: "/infra/sites/default/enforcement-points/default/transport-zones/tz".to_string(),
            segment_paths: ["/infra/segments/p1", "/infra/segments/p2"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..ParentConfig::default()
        }
    }

    #[test]
    fn segment_path_order_does_not_affect_equality() {
        let a = config("v1", "ns", "net");
        let mut b = config("v1", "ns", "net");
        b.segment_paths = ["/infra/segments/p2", "/infra/segments/p1"]
            .into_iter()
            .map(String::from)
            .collect();
        assert!(a.same_as(&b));
    }

    #[test]
    fn block_path_change_breaks_equality() {
        let a = config("v1", "ns", "net");
        let mut b = config("v1", "ns", "net");
        b.private_ip_block_path = "/infra/ip-blocks/other".to_string();
        assert!(!a.same_as(&b));
    }

    #[test]
    fn namespaced_name_lookup_follows_apply_and_delete() {
        let store = ParentConfigStore::new();
        store.apply([config("v1", "ns", "net")]);
        assert!(store.get_by_namespace_name("ns", "net").is_some());
        assert!(store.get_by_namespace_name("other", "net").is_none());

        let mut tombstone = config("v1", "ns", "net");
        tombstone.marked_for_delete = true;
        store.apply([tombstone]);
        assert!(store.get("v1").is_none());
        assert!(store.get_by_namespace_name("ns", "net").is_none());
    }
}
