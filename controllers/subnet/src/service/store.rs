//! In-memory caches of backend resources, one per kind.
//!
//! A store owns no business logic, only storage plus tag-derived
//! secondary indexes. It is populated once at startup from a full
//! backend listing and afterwards kept current exclusively through
//! `apply` calls that follow successful backend writes.

use policy_client::{PolicyError, PolicyObject, PolicyResource, filter_tag_values};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

/// Extracts zero or more index keys from a resource.
pub type IndexFn<T> = Box<dyn Fn(&T) -> Vec<String> + Send + Sync>;

struct Index<T> {
    key_fn: IndexFn<T>,
    entries: HashMap<String, HashSet<String>>,
}

struct Inner<T> {
    by_id: HashMap<String, T>,
    indexes: HashMap<&'static str, Index<T>>,
}

/// Cache of one backend resource kind with named secondary indexes.
///
/// Index key functions extract zero or more keys per resource
/// (usually tag values for a scope); a resource yielding no keys is
/// simply absent from that index, which is not an error. All methods
/// are safe under concurrent reconcile workers.
pub struct ResourceStore<T> {
    inner: RwLock<Inner<T>>,
}

impl<T: PolicyObject> ResourceStore<T> {
    /// A store with the given named indexes.
    pub fn new(indexes: Vec<(&'static str, IndexFn<T>)>) -> Self {
        let indexes = indexes
            .into_iter()
            .map(|(name, key_fn)| {
                (
                    name,
                    Index {
                        key_fn,
                        entries: HashMap::new(),
                    },
                )
            })
            .collect();
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                indexes,
            }),
        }
    }

    /// Upsert a resource, reindexing it under every index.
    pub fn add(&self, resource: T) {
        let mut inner = self.write();
        let id = resource.id().to_string();
        if let Some(previous) = inner.by_id.remove(&id) {
            Self::unindex(&mut inner, &previous);
        }
        Self::index(&mut inner, &resource);
        inner.by_id.insert(id, resource);
    }

    /// Remove a resource and its index entries. Removing an absent id
    /// is a no-op.
    pub fn delete(&self, resource: &T) {
        let mut inner = self.write();
        if let Some(previous) = inner.by_id.remove(resource.id()) {
            Self::unindex(&mut inner, &previous);
        }
    }

    /// Upsert or remove one resource based on its tombstone flag.
    pub fn apply_one(&self, resource: T) {
        if resource.marked_for_delete() {
            debug!(id = resource.id(), kind = %T::KIND, "Removing resource from store");
            self.delete(&resource);
        } else {
            debug!(id = resource.id(), kind = %T::KIND, "Adding resource to store");
            self.add(resource);
        }
    }

    /// Apply a batch, dispatching each item on its tombstone flag.
    pub fn apply(&self, resources: impl IntoIterator<Item = T>) {
        for resource in resources {
            self.apply_one(resource);
        }
    }

    /// Look up by primary id.
    pub fn get_by_key(&self, id: &str) -> Option<T> {
        self.read().by_id.get(id).cloned()
    }

    /// Every resource under `value` in the named index.
    ///
    /// # Panics
    ///
    /// Panics when `index` was not registered; the set of index names
    /// is fixed at construction, so an unknown name is a programmer
    /// error.
    pub fn get_by_index(&self, index: &str, value: &str) -> Vec<T> {
        let inner = self.read();
        let idx = inner
            .indexes
            .get(index)
            .unwrap_or_else(|| panic!("unknown index {index} on {} store", T::KIND));
        let Some(ids) = idx.entries.get(value) else {
            info!(kind = %T::KIND, index, value, "No resources found with index");
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.by_id.get(id).cloned())
            .collect()
    }

    /// Every cached resource, in no particular order.
    pub fn list(&self) -> Vec<T> {
        self.read().by_id.values().cloned().collect()
    }

    fn index(inner: &mut Inner<T>, resource: &T) {
        let id = resource.id().to_string();
        for idx in inner.indexes.values_mut() {
            for key in (idx.key_fn)(resource) {
                idx.entries.entry(key).or_default().insert(id.clone());
            }
        }
    }

    fn unindex(inner: &mut Inner<T>, resource: &T) {
        let id = resource.id();
        for idx in inner.indexes.values_mut() {
            for key in (idx.key_fn)(resource) {
                if let Some(ids) = idx.entries.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        idx.entries.remove(&key);
                    }
                }
            }
        }
    }

    #[allow(clippy::unwrap_used, reason = "store lock is never poisoned: no panics under it")]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap()
    }

    #[allow(clippy::unwrap_used, reason = "store lock is never poisoned: no panics under it")]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap()
    }
}

impl<T> std::fmt::Debug for ResourceStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore").finish_non_exhaustive()
    }
}

impl<T> ResourceStore<T>
where
    T: PolicyObject + TryFrom<PolicyResource, Error = PolicyError>,
{
    /// Populate the store from a full backend listing. A listing entry
    /// of the wrong kind is fatal, never silently skipped.
    pub fn load(&self, listing: Vec<PolicyResource>) -> Result<(), PolicyError> {
        for entry in listing {
            self.add(T::try_from(entry)?);
        }
        Ok(())
    }
}

/// An index keyed on every tag value under `scope`.
pub fn index_by_tag_scope<T: PolicyObject>(scope: &'static str) -> IndexFn<T> {
    Box::new(move |resource| filter_tag_values(resource.tags(), scope))
}

/// An index keyed on the backend-assigned address path.
pub fn index_by_path<T: PolicyObject>() -> IndexFn<T> {
    Box::new(|resource| resource.path().map(str::to_string).into_iter().collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use policy_client::{IpPoolSubnet, Segment, TAG_SCOPE_CHILD_SUBNET_UID, Tag};

    fn segment(id: &str, owner: Option<&str>) -> Segment {
        Segment {
            id: id.to_string(),
            tags: owner
                .map(|uid| vec![Tag::new(TAG_SCOPE_CHILD_SUBNET_UID, uid)])
                .unwrap_or_default(),
            ..Segment::default()
        }
    }

    fn store() -> ResourceStore<Segment> {
        ResourceStore::new(vec![(
            TAG_SCOPE_CHILD_SUBNET_UID,
            index_by_tag_scope(TAG_SCOPE_CHILD_SUBNET_UID),
        )])
    }

    #[test]
    fn apply_tombstone_removes_entry() {
        let store: ResourceStore<IpPoolSubnet> = ResourceStore::new(Vec::new());
        store.apply_one(IpPoolSubnet {
            id: "x".to_string(),
            ..IpPoolSubnet::default()
        });
        assert!(store.get_by_key("x").is_some());
        store.apply_one(IpPoolSubnet {
            id: "x".to_string(),
            marked_for_delete: true,
            ..IpPoolSubnet::default()
        });
        assert!(store.get_by_key("x").is_none());
    }

    #[test]
    fn resource_without_tag_scope_is_excluded_from_index() {
        let store = store();
        store.add(segment("cs_u1", Some("u1")));
        store.add(segment("cs_orphan", None));
        assert_eq!(
            store
                .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, "u1")
                .iter()
                .map(|s| s.id.as_str())
                .collect::<Vec<_>>(),
            ["cs_u1"]
        );
        assert!(store.get_by_key("cs_orphan").is_some());
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn reindexing_drops_stale_index_entries() {
        let store = store();
        store.add(segment("cs_u1", Some("u1")));
        store.add(segment("cs_u1", Some("u2")));
        assert!(store.get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, "u1").is_empty());
        assert_eq!(store.get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, "u2").len(), 1);
    }

    #[test]
    fn load_rejects_kind_mismatch() {
        let store: ResourceStore<IpPoolSubnet> = ResourceStore::new(Vec::new());
        let err = store
            .load(vec![segment("cs_u1", None).into()])
            .unwrap_err();
        assert!(matches!(err, PolicyError::UnexpectedKind { .. }));
    }
}
