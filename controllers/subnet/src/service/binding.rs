//! SubnetBinding flows.
//!
//! A SubnetBinding attaches one bound subnet to a set of parent
//! subnets through VLAN-tagged binding maps that live under the bound
//! subnet's org-rooted address. All maps of one reconcile go out in a
//! single merged-tree PATCH so the backend applies them atomically.

use super::{INDEX_SUBNET_PATH, SubnetService, builders, tree};
use crate::error::ControllerError;
use crate::service::compare::compare_resources;
use policy_client::{SubnetBindingMap, TAG_SCOPE_SUBNET_BINDING_UID, filter_tag_values};
use std::collections::HashSet;
use tracing::{error, info};

/// Normalized SubnetBinding spec handed in by the reconciler.
#[derive(Debug, Clone)]
pub struct SubnetBindingRequest {
    /// Owning CR UID
    pub uid: String,
    /// Owning CR namespace
    pub namespace: String,
    /// Owning CR name
    pub name: String,
    /// Backend address of the bound subnet
    pub subnet_path: String,
    /// How the parent subnets are resolved
    pub parent: BindingParent,
    /// Explicit VLAN tag; allocated when absent
    pub vlan: Option<i64>,
}

/// Parent resolution modes of a SubnetBinding.
#[derive(Debug, Clone)]
pub enum BindingParent {
    /// Explicit parent subnet paths.
    Subnets(Vec<String>),
    /// Every backend subnet tagged with the named subnet set.
    SubnetSet(String),
    /// Every subnet of the named VirtualNetwork.
    VirtualNetwork(String),
}

impl SubnetService {
    /// Converge the binding maps of one SubnetBinding. Returns the
    /// VLAN tag in effect.
    pub async fn create_or_update_subnet_binding(
        &self,
        request: &SubnetBindingRequest,
    ) -> Result<i64, ControllerError> {
        let parent_paths = self.resolve_binding_parents(request)?;
        let existing = self
            .subnet_binding_map_store
            .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, &request.uid);
        let vlan = match request.vlan {
            Some(vlan) => vlan,
            None => match existing.iter().find_map(|map| map.vlan_traffic_tag) {
                Some(vlan) => vlan,
                None => self.allocate_binding_vlan(request, &parent_paths)?,
            },
        };

        let tags = builders::subnet_binding_tags(&self.cluster, &request.namespace, &request.uid);
        let desired: Vec<SubnetBindingMap> = parent_paths
            .iter()
            .map(|parent_path| {
                let parent_id = builders::id_from_path(parent_path);
                SubnetBindingMap {
                    id: builders::subnet_binding_map_id(&request.uid, parent_id),
                    display_name: Some(builders::generate_display_name(
                        &request.name,
                        builders::SUBNET_BINDING_MAP_PREFIX,
                        parent_id,
                    )),
                    subnet_path: Some(parent_path.clone()),
                    vlan_traffic_tag: Some(vlan),
                    tags: tags.clone(),
                    parent_path: Some(request.subnet_path.clone()),
                    ..SubnetBindingMap::default()
                }
            })
            .collect();

        let (changed, mut stale) = compare_resources(&existing, &desired);
        if changed.is_empty() && stale.is_empty() {
            return Ok(vlan);
        }
        for map in &mut stale {
            map.marked_for_delete = true;
        }
        let batch: Vec<SubnetBindingMap> = changed.into_iter().chain(stale).collect();
        info!(
            uid = request.uid,
            maps = batch.len(),
            vlan,
            "Updating subnet binding maps"
        );
        if let Some(org_root) = tree::build_org_root(batch.clone(), None, None)? {
            self.client.patch_org_root(&org_root).await?;
        }
        self.subnet_binding_map_store.apply(batch);
        Ok(vlan)
    }

    /// Tear down every binding map of one SubnetBinding.
    pub async fn delete_subnet_binding(&self, uid: &str) -> Result<(), ControllerError> {
        let mut maps = self
            .subnet_binding_map_store
            .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, uid);
        if maps.is_empty() {
            return Ok(());
        }
        for map in &mut maps {
            map.marked_for_delete = true;
        }
        if let Some(org_root) = tree::build_org_root(maps.clone(), Some(true), None)? {
            self.client.patch_org_root(&org_root).await?;
        }
        self.subnet_binding_map_store.apply(maps);
        info!(uid, "Deleted subnet binding maps");
        Ok(())
    }

    /// Tear down binding-map families whose owning SubnetBinding is no
    /// longer in `live_uids`. Best effort like the child-subnet sweep:
    /// a failing family is logged and the sweep moves on.
    pub async fn sweep_stale_subnet_bindings(&self, live_uids: &HashSet<String>) {
        let stale: HashSet<String> = self
            .subnet_binding_map_store
            .list()
            .iter()
            .filter_map(|map| {
                filter_tag_values(&map.tags, TAG_SCOPE_SUBNET_BINDING_UID)
                    .into_iter()
                    .next()
            })
            .filter(|uid| !live_uids.contains(uid))
            .collect();
        for uid in stale {
            info!(uid, "Sweeping stale subnet binding maps");
            if let Err(err) = self.delete_subnet_binding(&uid).await {
                error!(uid, %err, "Failed to sweep stale subnet binding, continuing");
            }
        }
    }

    fn resolve_binding_parents(
        &self,
        request: &SubnetBindingRequest,
    ) -> Result<Vec<String>, ControllerError> {
        let paths = match &request.parent {
            BindingParent::Subnets(paths) => paths.clone(),
            BindingParent::SubnetSet(name) => self
                .subnet_store
                .get_by_index(policy_client::TAG_SCOPE_SUBNET_SET, name)
                .into_iter()
                .filter_map(|subnet| subnet.path)
                .collect(),
            BindingParent::VirtualNetwork(name) => {
                let config = self
                    .parent_configs
                    .get_by_namespace_name(&request.namespace, name)
                    .ok_or_else(|| {
                        ControllerError::Validation(format!(
                            "parent configuration for {}/{name} not ready",
                            request.namespace
                        ))
                    })?;
                self.subnet_store
                    .get_by_index(policy_client::TAG_SCOPE_VNETWORK_UID, &config.id)
                    .into_iter()
                    .filter_map(|subnet| subnet.path)
                    .collect()
            }
        };
        if paths.is_empty() {
            return Err(ControllerError::Validation(format!(
                "subnet binding {}/{} resolves no parent subnets",
                request.namespace, request.name
            )));
        }
        Ok(paths)
    }

    fn allocate_binding_vlan(
        &self,
        request: &SubnetBindingRequest,
        parent_paths: &[String],
    ) -> Result<i64, ControllerError> {
        let mut used = HashSet::new();
        for path in parent_paths {
            for map in self
                .subnet_binding_map_store
                .get_by_index(INDEX_SUBNET_PATH, path)
            {
                used.extend(map.vlan_traffic_tag);
            }
        }
        super::next_vlan(&used).ok_or_else(|| {
            ControllerError::AllocationExhausted(format!(
                "no VLAN tag left for {}/{} across {} parent subnets",
                request.namespace,
                request.name,
                parent_paths.len()
            ))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use policy_client::{
        MockPolicyClient, Subnet, TAG_SCOPE_SUBNET_SET, TAG_SCOPE_VNETWORK_UID, Tag,
    };
    use std::sync::Arc;
    use std::time::Duration;

    const CHILD: &str = "/orgs/default/projects/proj1/vnetworks/net1/subnets/child";
    const PARENT_A: &str = "/orgs/default/projects/proj1/vnetworks/net1/subnets/parent-a";
    const PARENT_B: &str = "/orgs/default/projects/proj1/vnetworks/net1/subnets/parent-b";

    fn service_with(client: &MockPolicyClient) -> SubnetService {
        SubnetService::new(Arc::new(client.clone()), "cluster-a".to_string(), false)
            .realize_budget(0, Duration::ZERO)
    }

    fn request(parents: Vec<String>, vlan: Option<i64>) -> SubnetBindingRequest {
        SubnetBindingRequest {
            uid: "b1".to_string(),
            namespace: "default".to_string(),
            name: "bind".to_string(),
            subnet_path: CHILD.to_string(),
            parent: BindingParent::Subnets(parents),
            vlan,
        }
    }

    #[tokio::test]
    async fn create_builds_one_map_per_parent() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);

        let vlan = service
            .create_or_update_subnet_binding(&request(
                vec![PARENT_A.to_string(), PARENT_B.to_string()],
                None,
            ))
            .await
            .unwrap();

        assert_eq!(vlan, 1);
        assert_eq!(client.org_root_patches().len(), 1);
        let maps = service
            .subnet_binding_map_store
            .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, "b1");
        assert_eq!(maps.len(), 2);
        assert!(maps.iter().all(|m| m.vlan_traffic_tag == Some(1)));
        assert!(maps.iter().all(|m| m.parent_path.as_deref() == Some(CHILD)));
    }

    #[tokio::test]
    async fn unchanged_binding_writes_nothing() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);
        let req = request(vec![PARENT_A.to_string()], None);

        service.create_or_update_subnet_binding(&req).await.unwrap();
        let vlan = service.create_or_update_subnet_binding(&req).await.unwrap();

        assert_eq!(vlan, 1);
        assert_eq!(client.org_root_patches().len(), 1);
    }

    #[tokio::test]
    async fn explicit_vlan_is_honored() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);

        let vlan = service
            .create_or_update_subnet_binding(&request(vec![PARENT_A.to_string()], Some(100)))
            .await
            .unwrap();

        assert_eq!(vlan, 100);
        let maps = service
            .subnet_binding_map_store
            .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, "b1");
        assert_eq!(maps[0].vlan_traffic_tag, Some(100));
    }

    #[tokio::test]
    async fn allocation_skips_vlans_used_on_the_parent() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);
        service.subnet_binding_map_store.add(SubnetBindingMap {
            id: "sbm_other_parent-a".to_string(),
            subnet_path: Some(PARENT_A.to_string()),
            vlan_traffic_tag: Some(1),
            parent_path: Some(CHILD.to_string()),
            ..SubnetBindingMap::default()
        });

        let vlan = service
            .create_or_update_subnet_binding(&request(vec![PARENT_A.to_string()], None))
            .await
            .unwrap();
        assert_eq!(vlan, 2);
    }

    #[tokio::test]
    async fn delete_tombstones_every_map() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);
        service
            .create_or_update_subnet_binding(&request(
                vec![PARENT_A.to_string(), PARENT_B.to_string()],
                None,
            ))
            .await
            .unwrap();

        service.delete_subnet_binding("b1").await.unwrap();

        assert_eq!(client.org_root_patches().len(), 2);
        assert!(service
            .subnet_binding_map_store
            .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, "b1")
            .is_empty());
    }

    #[tokio::test]
    async fn virtual_network_parents_resolve_from_the_subnet_store() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);
        service
            .parent_configs
            .apply([crate::service::parent::ParentConfig {
                id: "v1".to_string(),
                name: "net1".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            }]);
        service.subnet_store.add(Subnet {
            id: "parent-a".to_string(),
            tags: vec![Tag::new(TAG_SCOPE_VNETWORK_UID, "v1")],
            path: Some(PARENT_A.to_string()),
            ..Subnet::default()
        });

        let mut req = request(Vec::new(), None);
        req.parent = BindingParent::VirtualNetwork("net1".to_string());
        let vlan = service.create_or_update_subnet_binding(&req).await.unwrap();
        assert_eq!(vlan, 1);
        let maps = service
            .subnet_binding_map_store
            .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, "b1");
        assert_eq!(maps[0].subnet_path.as_deref(), Some(PARENT_A));
    }

    #[tokio::test]
    async fn subnet_set_parents_resolve_by_tag() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);
        service.subnet_store.add(Subnet {
            id: "parent-a".to_string(),
            tags: vec![Tag::new(TAG_SCOPE_SUBNET_SET, "set1")],
            path: Some(PARENT_A.to_string()),
            ..Subnet::default()
        });
        service.subnet_store.add(Subnet {
            id: "parent-b".to_string(),
            tags: vec![Tag::new(TAG_SCOPE_SUBNET_SET, "set1")],
            path: Some(PARENT_B.to_string()),
            ..Subnet::default()
        });
        service.subnet_store.add(Subnet {
            id: "other".to_string(),
            tags: vec![Tag::new(TAG_SCOPE_SUBNET_SET, "set2")],
            path: Some("/orgs/default/projects/proj1/vnetworks/net1/subnets/other".to_string()),
            ..Subnet::default()
        });

        let mut req = request(Vec::new(), None);
        req.parent = BindingParent::SubnetSet("set1".to_string());
        service.create_or_update_subnet_binding(&req).await.unwrap();

        let maps = service
            .subnet_binding_map_store
            .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, "b1");
        assert_eq!(maps.len(), 2);
        let bound: Vec<_> = maps.iter().filter_map(|m| m.subnet_path.as_deref()).collect();
        assert!(bound.contains(&PARENT_A));
        assert!(bound.contains(&PARENT_B));
    }

    #[tokio::test]
    async fn empty_subnet_set_fails_validation() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);

        let mut req = request(Vec::new(), None);
        req.parent = BindingParent::SubnetSet("set1".to_string());
        let err = service
            .create_or_update_subnet_binding(&req)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }

    #[tokio::test]
    async fn sweep_removes_binding_maps_without_a_live_owner() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);
        service
            .create_or_update_subnet_binding(&request(vec![PARENT_A.to_string()], None))
            .await
            .unwrap();
        let mut other = request(vec![PARENT_B.to_string()], None);
        other.uid = "b2".to_string();
        other.name = "bind-2".to_string();
        service.create_or_update_subnet_binding(&other).await.unwrap();

        let live: HashSet<String> = ["b1".to_string()].into();
        service.sweep_stale_subnet_bindings(&live).await;

        assert!(service
            .subnet_binding_map_store
            .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, "b2")
            .is_empty());
        assert_eq!(
            service
                .subnet_binding_map_store
                .get_by_index(TAG_SCOPE_SUBNET_BINDING_UID, "b1")
                .len(),
            1
        );
        // Two creates plus one tombstone patch for the swept family.
        assert_eq!(client.org_root_patches().len(), 3);
    }

    #[tokio::test]
    async fn missing_parents_fail_validation() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);

        let err = service
            .create_or_update_subnet_binding(&request(Vec::new(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }
}
