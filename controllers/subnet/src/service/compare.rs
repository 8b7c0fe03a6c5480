//! State diff engine.
//!
//! Compares a freshly built desired set against the cached existing
//! set and yields the items to resubmit (`changed`) and the cached
//! items no longer desired (`stale`). The engine never mutates:
//! callers tombstone the stale items themselves before resubmission.

use policy_client::{IpPoolSubnet, Segment, SegmentBindingMap, SubnetBindingMap};
use serde_json::{Value, json};
use std::collections::HashMap;

/// A resource the diff engine can compare.
///
/// `value` is a canonicalized form excluding volatile backend
/// metadata (revision counters, realized paths) and including only
/// the fields a spec change can alter.
pub trait Comparable {
    /// Stable identity within the compared set.
    fn key(&self) -> &str;
    /// Canonical compared form.
    fn value(&self) -> Value;
}

/// Diff `desired` against `existing` by key.
///
/// A desired item with no existing item of the same key, or whose
/// canonical value differs, is changed. An existing item whose key is
/// absent from the desired set is stale. `compare(s, s)` is empty for
/// any set `s` with unique keys.
pub fn compare_resources<T: Comparable + Clone>(
    existing: &[T],
    desired: &[T],
) -> (Vec<T>, Vec<T>) {
    let existing_by_key: HashMap<&str, &T> =
        existing.iter().map(|item| (item.key(), item)).collect();

    let mut changed = Vec::new();
    for item in desired {
        match existing_by_key.get(item.key()) {
            Some(current) if current.value() == item.value() => {}
            _ => changed.push(item.clone()),
        }
    }

    let desired_keys: HashMap<&str, ()> =
        desired.iter().map(|item| (item.key(), ())).collect();
    let stale = existing
        .iter()
        .filter(|item| !desired_keys.contains_key(item.key()))
        .cloned()
        .collect();

    (changed, stale)
}

impl Comparable for Segment {
    fn key(&self) -> &str {
        &self.id
    }

    fn value(&self) -> Value {
        json!({
            "id": self.id,
            "display_name": self.display_name,
            "tags": self.tags,
        })
    }
}

impl Comparable for SegmentBindingMap {
    fn key(&self) -> &str {
        &self.id
    }

    fn value(&self) -> Value {
        json!({
            "id": self.id,
            "display_name": self.display_name,
            "tags": self.tags,
            "segment_path": self.segment_path,
            "vlan_traffic_tag": self.vlan_traffic_tag,
        })
    }
}

impl Comparable for SubnetBindingMap {
    fn key(&self) -> &str {
        &self.id
    }

    fn value(&self) -> Value {
        json!({
            "id": self.id,
            "display_name": self.display_name,
            "tags": self.tags,
            "subnet_path": self.subnet_path,
            "vlan_traffic_tag": self.vlan_traffic_tag,
        })
    }
}

impl Comparable for IpPoolSubnet {
    fn key(&self) -> &str {
        &self.id
    }

    fn value(&self) -> Value {
        json!({
            "id": self.id,
            "display_name": self.display_name,
            "tags": self.tags,
            "ip_block_path": self.ip_block_path,
            "size": self.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(id: &str, size: i64) -> IpPoolSubnet {
        IpPoolSubnet {
            id: id.to_string(),
            size: Some(size),
            ..IpPoolSubnet::default()
        }
    }

    fn binding(id: &str, vlan: i64) -> SegmentBindingMap {
        SegmentBindingMap {
            id: id.to_string(),
            vlan_traffic_tag: Some(vlan),
            ..SegmentBindingMap::default()
        }
    }

    #[test]
    fn identical_sets_yield_no_changes() {
        let existing = vec![subnet("ibs_u1_s1", 256)];
        let desired = vec![subnet("ibs_u1_s1", 256)];
        let (changed, stale) = compare_resources(&existing, &desired);
        assert!(changed.is_empty());
        assert!(stale.is_empty());
    }

    #[test]
    fn value_change_is_reported_as_changed() {
        let existing = vec![subnet("ibs_u1_s1", 256)];
        let desired = vec![subnet("ibs_u1_s1", 512)];
        let (changed, stale) = compare_resources(&existing, &desired);
        assert_eq!(changed.len(), 1);
        assert!(stale.is_empty());
    }

    #[test]
    fn missing_desired_key_is_stale() {
        let existing = vec![binding("scbm_u1_p1", 10), binding("scbm_u1_p2", 11)];
        let desired = vec![binding("scbm_u1_p1", 10)];
        let (changed, stale) = compare_resources(&existing, &desired);
        assert!(changed.is_empty());
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "scbm_u1_p2");
    }

    #[test]
    fn new_desired_key_is_changed_and_stale_is_key_difference() {
        let existing = vec![binding("scbm_u1_p1", 10)];
        let desired = vec![binding("scbm_u1_p1", 10), binding("scbm_u1_p3", 12)];
        let (changed, stale) = compare_resources(&existing, &desired);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "scbm_u1_p3");
        assert!(stale.is_empty());
    }
}
