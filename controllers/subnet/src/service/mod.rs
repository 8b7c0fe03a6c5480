//! Backend resource synchronization.
//!
//! `SubnetService` owns the per-kind resource stores, the parent
//! configuration store, and the exhaustion tracker, and drives the
//! create/update/delete flows for ChildSubnet, SubnetBinding, and
//! VirtualNetwork resources. The stores are populated once at startup
//! from tag-scoped backend listings and afterwards updated only after
//! a successful backend write, so they always reflect what the
//! backend has acknowledged.

pub mod alloc;
pub mod binding;
pub mod builders;
pub mod compare;
pub mod parent;
pub mod store;
pub mod tree;
pub mod wrap;

pub use binding::{BindingParent, SubnetBindingRequest};

use crate::error::ControllerError;
use crds::AccessMode;
use policy_client::{
    IpBlock, IpPool, IpPoolSubnet, NatRule, PolicyClientTrait, ResourceKind, Segment,
    SegmentBindingMap, Subnet, SubnetBindingMap, TAG_SCOPE_CHILD_SUBNET_UID, TAG_SCOPE_CLUSTER,
    TAG_SCOPE_PROJECT_UID, TAG_SCOPE_SUBNET_BINDING_UID, TAG_SCOPE_SUBNET_SET,
    TAG_SCOPE_VNETWORK_UID, Tag, Tier1,
    filter_tag_values,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use self::alloc::{ExhaustedBlocks, extract_exhausted_block, next_vlan};
use self::compare::compare_resources;
use self::parent::{ParentConfig, ParentConfigStore};
use self::store::{ResourceStore, index_by_path, index_by_tag_scope};

pub(crate) const INDEX_SEGMENT_PATH: &str = "segment_path";
pub(crate) const INDEX_SUBNET_PATH: &str = "subnet_path";
pub(crate) const INDEX_PATH: &str = "path";

/// Normalized ChildSubnet spec handed in by the reconciler.
#[derive(Debug, Clone)]
pub struct ChildSubnetRequest {
    /// Owning CR UID
    pub uid: String,
    /// Owning CR namespace
    pub namespace: String,
    /// Owning CR name
    pub name: String,
    /// Name of the upstream VirtualNetwork in the same namespace
    pub parent: String,
    /// Prefix length of the requested subnet
    pub prefix_length: u8,
    /// Whether the subnet is reachable from outside the network
    pub access_mode: AccessMode,
}

/// Normalized VirtualNetwork identity handed in by the reconciler.
#[derive(Debug, Clone)]
pub struct VirtualNetworkRequest {
    /// Owning CR UID
    pub uid: String,
    /// Owning CR namespace
    pub namespace: String,
    /// Owning CR name
    pub name: String,
}

/// Result of a ChildSubnet reconcile, consumed for status writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildSubnetOutcome {
    /// The backend resource family exists and is realized.
    Provisioned {
        /// Backend address of the created segment
        resource_path: String,
        /// Gateways in `$address/$prefixLength` form
        gateway_cidrs: Vec<String>,
        /// VLAN tag bound to the parent segments
        vlan: Option<i64>,
    },
    /// The pool subnet was created but did not realize within the
    /// polling budget; it has been rolled back and the caller should
    /// retry on the next cycle.
    NotRealized,
}

/// Synchronizes backend networking resources with the desired state
/// of the vnetops custom resources.
pub struct SubnetService {
    client: Arc<dyn PolicyClientTrait>,
    cluster: String,
    project_scoped_blocks: bool,
    realize_retries: u32,
    realize_delay: Duration,

    ip_block_store: ResourceStore<IpBlock>,
    ip_pool_store: ResourceStore<IpPool>,
    ip_pool_subnet_store: ResourceStore<IpPoolSubnet>,
    child_segment_store: ResourceStore<Segment>,
    parent_segment_store: ResourceStore<Segment>,
    segment_binding_map_store: ResourceStore<SegmentBindingMap>,
    tier1_store: ResourceStore<Tier1>,
    nat_rule_store: ResourceStore<NatRule>,
    subnet_store: ResourceStore<Subnet>,
    subnet_binding_map_store: ResourceStore<SubnetBindingMap>,
    parent_configs: ParentConfigStore,
    exhausted_blocks: ExhaustedBlocks,
}

impl SubnetService {
    /// A service with empty stores; call [`SubnetService::init`]
    /// before serving reconciles.
    pub fn new(
        client: Arc<dyn PolicyClientTrait>,
        cluster: String,
        project_scoped_blocks: bool,
    ) -> Self {
        Self {
            client,
            cluster,
            project_scoped_blocks,
            realize_retries: alloc::REALIZE_MAX_RETRIES,
            realize_delay: alloc::REALIZE_RETRY_DELAY,
            ip_block_store: ResourceStore::new(vec![
                (TAG_SCOPE_CLUSTER, index_by_tag_scope(TAG_SCOPE_CLUSTER)),
                (
                    TAG_SCOPE_PROJECT_UID,
                    index_by_tag_scope(TAG_SCOPE_PROJECT_UID),
                ),
            ]),
            ip_pool_store: ResourceStore::new(vec![(
                TAG_SCOPE_CHILD_SUBNET_UID,
                index_by_tag_scope(TAG_SCOPE_CHILD_SUBNET_UID),
            )]),
            ip_pool_subnet_store: ResourceStore::new(vec![(
                TAG_SCOPE_CHILD_SUBNET_UID,
                index_by_tag_scope(TAG_SCOPE_CHILD_SUBNET_UID),
            )]),
            child_segment_store: ResourceStore::new(vec![(
                TAG_SCOPE_CHILD_SUBNET_UID,
                index_by_tag_scope(TAG_SCOPE_CHILD_SUBNET_UID),
            )]),
            parent_segment_store: ResourceStore::new(vec![(
                TAG_SCOPE_VNETWORK_UID,
                index_by_tag_scope(TAG_SCOPE_VNETWORK_UID),
            )]),
            segment_binding_map_store: ResourceStore::new(vec![
                (
                    TAG_SCOPE_CHILD_SUBNET_UID,
                    index_by_tag_scope(TAG_SCOPE_CHILD_SUBNET_UID),
                ),
                (
                    INDEX_SEGMENT_PATH,
                    Box::new(|map: &SegmentBindingMap| {
                        map.segment_path.iter().cloned().collect::<Vec<String>>()
                    }),
                ),
            ]),
            tier1_store: ResourceStore::new(vec![(INDEX_PATH, index_by_path())]),
            nat_rule_store: ResourceStore::new(vec![(
                TAG_SCOPE_CHILD_SUBNET_UID,
                index_by_tag_scope(TAG_SCOPE_CHILD_SUBNET_UID),
            )]),
            subnet_store: ResourceStore::new(vec![
                (
                    TAG_SCOPE_VNETWORK_UID,
                    index_by_tag_scope(TAG_SCOPE_VNETWORK_UID),
                ),
                (TAG_SCOPE_SUBNET_SET, index_by_tag_scope(TAG_SCOPE_SUBNET_SET)),
            ]),
            subnet_binding_map_store: ResourceStore::new(vec![
                (
                    TAG_SCOPE_SUBNET_BINDING_UID,
                    index_by_tag_scope(TAG_SCOPE_SUBNET_BINDING_UID),
                ),
                (
                    INDEX_SUBNET_PATH,
                    Box::new(|map: &SubnetBindingMap| {
                        map.subnet_path.iter().cloned().collect::<Vec<String>>()
                    }),
                ),
            ]),
            parent_configs: ParentConfigStore::new(),
            exhausted_blocks: ExhaustedBlocks::new(),
        }
    }

    /// Override the realized-state polling budget.
    pub fn realize_budget(mut self, retries: u32, delay: Duration) -> Self {
        self.realize_retries = retries;
        self.realize_delay = delay;
        self
    }

    /// Populate every store from tag-scoped backend listings.
    ///
    /// One listing per kind, all in flight at once; any failing
    /// listing aborts initialization with that error.
    pub async fn init(&self) -> Result<(), ControllerError> {
        let cluster_tag = vec![Tag::new(TAG_SCOPE_CLUSTER, &self.cluster)];
        let child_segment_tags = vec![
            Tag::new(TAG_SCOPE_CLUSTER, &self.cluster),
            Tag::scope(TAG_SCOPE_CHILD_SUBNET_UID),
        ];
        let vnetwork_tag = vec![Tag::scope(TAG_SCOPE_VNETWORK_UID)];
        let project_tag = vec![Tag::scope(TAG_SCOPE_PROJECT_UID)];

        let (
            blocks,
            pools,
            pool_subnets,
            child_segments,
            parent_segments,
            segment_maps,
            tier1s,
            nat_rules,
            subnets,
            subnet_maps,
        ) = tokio::try_join!(
            self.client.search_resources(ResourceKind::IpBlock, &cluster_tag),
            self.client.search_resources(ResourceKind::IpPool, &cluster_tag),
            self.client
                .search_resources(ResourceKind::IpPoolSubnet, &cluster_tag),
            self.client
                .search_resources(ResourceKind::Segment, &child_segment_tags),
            self.client
                .search_resources(ResourceKind::Segment, &vnetwork_tag),
            self.client
                .search_resources(ResourceKind::SegmentBindingMap, &cluster_tag),
            self.client.search_resources(ResourceKind::Tier1, &project_tag),
            self.client.search_resources(ResourceKind::NatRule, &cluster_tag),
            self.client.search_resources(ResourceKind::Subnet, &vnetwork_tag),
            self.client
                .search_resources(ResourceKind::SubnetBindingMap, &cluster_tag),
        )?;

        self.ip_block_store.load(blocks)?;
        self.ip_pool_store.load(pools)?;
        self.ip_pool_subnet_store.load(pool_subnets)?;
        self.child_segment_store.load(child_segments)?;
        self.parent_segment_store.load(parent_segments)?;
        self.segment_binding_map_store.load(segment_maps)?;
        self.tier1_store.load(tier1s)?;
        self.nat_rule_store.load(nat_rules)?;
        self.subnet_store.load(subnets)?;
        self.subnet_binding_map_store.load(subnet_maps)?;

        info!(
            ip_blocks = self.ip_block_store.list().len(),
            child_segments = self.child_segment_store.list().len(),
            parent_segments = self.parent_segment_store.list().len(),
            "Initialized resource stores"
        );
        Ok(())
    }

    /// Converge the backend resource family of one ChildSubnet.
    pub async fn create_or_update_child_subnet(
        &self,
        request: &ChildSubnetRequest,
    ) -> Result<ChildSubnetOutcome, ControllerError> {
        let parent_config = self
            .parent_configs
            .get_by_namespace_name(&request.namespace, &request.parent)
            .ok_or_else(|| {
                ControllerError::Validation(format!(
                    "parent configuration for {}/{} not ready",
                    request.namespace, request.parent
                ))
            })?;
        if parent_config.segment_paths.is_empty() || parent_config.tier1_path.is_empty() {
            return Err(ControllerError::Validation(format!(
                "virtual network {}/{} has no segments yet",
                request.namespace, request.parent
            )));
        }

        match self
            .child_segment_store
            .get_by_key(&builders::segment_id(&request.uid))
        {
            Some(segment) => {
                self.update_binding_maps(request, &parent_config, segment)
                    .await
            }
            None => self.create_child_subnet(request, &parent_config).await,
        }
    }

    /// Update path: the segment already exists, only the bindings to
    /// the parent segments can drift (parents added or removed on the
    /// virtual network).
    async fn update_binding_maps(
        &self,
        request: &ChildSubnetRequest,
        parent_config: &ParentConfig,
        segment: Segment,
    ) -> Result<ChildSubnetOutcome, ControllerError> {
        let existing = self
            .segment_binding_map_store
            .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, &request.uid);
        let vlan = match existing.iter().find_map(|map| map.vlan_traffic_tag) {
            Some(vlan) => vlan,
            None => self.allocate_segment_vlan(request, parent_config)?,
        };

        let tags = builders::child_subnet_tags(
            &self.cluster,
            &request.namespace,
            &request.name,
            &request.uid,
        );
        let desired = builders::build_segment_binding_maps(
            &request.uid,
            &request.name,
            parent_config,
            vlan,
            &tags,
        );
        let (changed, mut stale) = compare_resources(&existing, &desired);
        if !changed.is_empty() || !stale.is_empty() {
            for map in &mut stale {
                map.marked_for_delete = true;
            }
            let batch: Vec<SegmentBindingMap> = changed.into_iter().chain(stale).collect();
            info!(
                uid = request.uid,
                maps = batch.len(),
                "Updating parent segment bindings"
            );
            let intent = wrap::wrap_hierarchy_child_segment(&segment, &batch)?;
            self.client.patch_infra(&intent).await?;
            self.segment_binding_map_store.apply(batch);
        }

        Ok(ChildSubnetOutcome::Provisioned {
            resource_path: segment
                .path
                .clone()
                .unwrap_or_else(|| builders::segment_intent_path(&request.uid)),
            gateway_cidrs: segment
                .subnets
                .iter()
                .filter_map(|subnet| subnet.gateway_address.clone())
                .collect(),
            vlan: Some(vlan),
        })
    }

    /// Create path: pool first, then realization, then the
    /// segment/binding/NAT family. Once the pool write has succeeded
    /// every later failure rolls the pool back before returning.
    async fn create_child_subnet(
        &self,
        request: &ChildSubnetRequest,
        parent_config: &ParentConfig,
    ) -> Result<ChildSubnetOutcome, ControllerError> {
        let vlan = self.allocate_segment_vlan(request, parent_config)?;
        let block_path = match request.access_mode {
            AccessMode::Public => parent_config.public_ip_block_path.clone(),
            AccessMode::Private => parent_config.private_ip_block_path.clone(),
        };
        if block_path.is_empty() {
            return Err(ControllerError::Validation(format!(
                "no IP block resolved for virtual network {}/{}",
                request.namespace, request.parent
            )));
        }
        if self.exhausted_blocks.contains(&block_path) {
            warn!(block_path, "Allocating from a block recently reported exhausted");
        }

        let tags = builders::child_subnet_tags(
            &self.cluster,
            &request.namespace,
            &request.name,
            &request.uid,
        );
        let (mut pool, mut pool_subnet) = builders::build_ip_pool_with_subnet(
            &request.uid,
            &request.name,
            &block_path,
            request.prefix_length,
            &tags,
        );
        let intent = wrap::wrap_hierarchy_ip_pool(&pool, &pool_subnet)?;
        if let Err(err) = self.client.patch_infra(&intent).await {
            if let Some(path) = extract_exhausted_block(&err) {
                self.exhausted_blocks.insert(&path);
                return Err(ControllerError::IpBlockExhausted { block_path: path });
            }
            return Err(err.into());
        }

        // The pool is durable on the backend from here on.
        let subnet_intent_path = builders::ip_pool_subnet_intent_path(&request.uid);
        let realized = match alloc::acquire_realized_subnet(
            self.client.as_ref(),
            &subnet_intent_path,
            self.realize_retries,
            self.realize_delay,
        )
        .await
        {
            Ok(Some(realized)) => realized,
            Ok(None) => {
                self.roll_back_pool(&pool, &pool_subnet).await;
                return Ok(ChildSubnetOutcome::NotRealized);
            }
            Err(err) => {
                self.roll_back_pool(&pool, &pool_subnet).await;
                return Err(err);
            }
        };

        let gateway = realized.gateway_cidr();
        let pool_path = builders::ip_pool_intent_path(&request.uid);
        let mut segment = builders::build_segment(
            &request.uid,
            &request.name,
            parent_config,
            &pool_path,
            &[gateway.clone()],
            &tags,
        );
        let binding_maps = builders::build_segment_binding_maps(
            &request.uid,
            &request.name,
            parent_config,
            vlan,
            &tags,
        );
        let tier1 = Tier1 {
            id: builders::id_from_path(&parent_config.tier1_path).to_string(),
            ..Tier1::default()
        };
        let nat = builders::build_default_nat_section();
        let nat_rules = builders::build_nat_rules(
            &request.uid,
            &request.name,
            request.access_mode,
            &[realized.cidr],
            &tags,
        );
        let intent =
            wrap::wrap_hierarchy_segment_and_nat(&segment, &binding_maps, Some(&tier1), &nat, &nat_rules)?;
        if let Err(err) = self.client.patch_infra(&intent).await {
            self.roll_back_pool(&pool, &pool_subnet).await;
            return Err(err.into());
        }

        let resource_path = builders::segment_intent_path(&request.uid);
        pool.path = Some(pool_path);
        pool_subnet.path = Some(subnet_intent_path);
        segment.path = Some(resource_path.clone());
        self.ip_pool_store.add(pool);
        self.ip_pool_subnet_store.add(pool_subnet);
        self.child_segment_store.add(segment);
        self.segment_binding_map_store.apply(binding_maps);
        self.nat_rule_store.apply(nat_rules);

        info!(
            uid = request.uid,
            path = resource_path,
            vlan,
            gateway,
            "Provisioned child subnet"
        );
        Ok(ChildSubnetOutcome::Provisioned {
            resource_path,
            gateway_cidrs: vec![gateway],
            vlan: Some(vlan),
        })
    }

    /// Tear down the backend resource family of one ChildSubnet.
    pub async fn delete_child_subnet(&self, uid: &str) -> Result<(), ControllerError> {
        let mut pool = self.ip_pool_store.get_by_key(&builders::ip_pool_id(uid));
        let mut pool_subnet = self
            .ip_pool_subnet_store
            .get_by_key(&builders::ip_pool_subnet_id(uid));
        let mut segment = self.child_segment_store.get_by_key(&builders::segment_id(uid));
        let mut binding_maps = self
            .segment_binding_map_store
            .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, uid);
        let mut nat_rules = self
            .nat_rule_store
            .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, uid);

        if let Some(pool) = pool.as_mut() {
            pool.marked_for_delete = true;
        }
        if let Some(pool_subnet) = pool_subnet.as_mut() {
            pool_subnet.marked_for_delete = true;
        }
        if let Some(segment) = segment.as_mut() {
            segment.marked_for_delete = true;
        }
        for map in &mut binding_maps {
            map.marked_for_delete = true;
        }
        for rule in &mut nat_rules {
            rule.marked_for_delete = true;
        }

        let tier1 = segment
            .as_ref()
            .and_then(|segment| segment.connectivity_path.as_deref())
            .map(|path| Tier1 {
                id: builders::id_from_path(path).to_string(),
                ..Tier1::default()
            });
        let nat = builders::build_default_nat_section();
        let block_path = pool_subnet
            .as_ref()
            .and_then(|subnet| subnet.ip_block_path.clone());

        if let Some(intent) = wrap::wrap_hierarchy_infra(
            pool.as_ref(),
            pool_subnet.as_ref(),
            segment.as_ref(),
            &binding_maps,
            tier1.as_ref(),
            &nat,
            &nat_rules,
        )? {
            self.client.patch_infra(&intent).await?;
        }

        if let Some(pool) = pool {
            self.ip_pool_store.apply_one(pool);
        }
        if let Some(pool_subnet) = pool_subnet {
            self.ip_pool_subnet_store.apply_one(pool_subnet);
        }
        if let Some(segment) = segment {
            self.child_segment_store.apply_one(segment);
        }
        self.segment_binding_map_store.apply(binding_maps);
        self.nat_rule_store.apply(nat_rules);
        if let Some(block_path) = block_path {
            self.exhausted_blocks.remove(&block_path);
        }

        info!(uid, "Deleted child subnet resources");
        Ok(())
    }

    /// Recompute the parent configuration snapshot of one
    /// VirtualNetwork. Returns whether the stored snapshot changed.
    pub async fn create_or_update_virtual_network(
        &self,
        request: &VirtualNetworkRequest,
    ) -> Result<bool, ControllerError> {
        self.sync_parent_segments(&request.uid).await?;

        let segments = self
            .parent_segment_store
            .get_by_index(TAG_SCOPE_VNETWORK_UID, &request.uid);
        let mut config = ParentConfig {
            id: request.uid.clone(),
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            ..ParentConfig::default()
        };
        // No segments yet is a valid empty snapshot, not an error;
        // child subnets stay pending until the network produces one.
        if let Some(first) = segments.first() {
            config.tier1_path = first.connectivity_path.clone().unwrap_or_default();
            config.transport_zone_path = first.transport_zone_path.clone().unwrap_or_default();
        }
        config.segment_paths = segments
            .iter()
            .filter_map(|segment| segment.path.clone())
            .collect();

        if let Some(block_path) = self.resolve_ip_block(&config) {
            config.set_ip_block_paths(&block_path, &block_path);
        } else {
            warn!(
                vnetwork = config.namespaced_name(),
                "No IP block resolved for virtual network"
            );
        }

        if let Some(previous) = self.parent_configs.get(&request.uid) {
            if previous.same_as(&config) {
                debug!(vnetwork = config.namespaced_name(), "Parent configuration unchanged");
                return Ok(false);
            }
        }
        info!(
            vnetwork = config.namespaced_name(),
            segments = config.segment_paths.len(),
            "Updating parent configuration"
        );
        self.parent_configs.apply([config]);
        Ok(true)
    }

    /// Drop the parent configuration of a deleted VirtualNetwork.
    pub fn delete_virtual_network(&self, uid: &str) {
        self.parent_configs.apply([ParentConfig {
            id: uid.to_string(),
            marked_for_delete: true,
            ..ParentConfig::default()
        }]);
    }

    /// Tear down resource families whose owning ChildSubnet is no
    /// longer in `live_uids`. Best effort: a failing family is logged
    /// and the sweep moves on; the next cycle converges.
    pub async fn sweep_stale_child_subnets(&self, live_uids: &HashSet<String>) {
        for segment in self.child_segment_store.list() {
            let Some(uid) = filter_tag_values(&segment.tags, TAG_SCOPE_CHILD_SUBNET_UID)
                .into_iter()
                .next()
            else {
                continue;
            };
            if live_uids.contains(&uid) {
                continue;
            }
            info!(uid, segment_id = segment.id, "Sweeping stale child subnet resources");
            if let Err(err) = self.delete_child_subnet(&uid).await {
                error!(uid, %err, "Failed to sweep stale child subnet, continuing");
            }
        }
    }

    /// Drop cached parent configurations whose owning VirtualNetwork
    /// is no longer in `live_uids`.
    pub fn sweep_stale_virtual_networks(&self, live_uids: &HashSet<String>) {
        for config in self.parent_configs.list() {
            if live_uids.contains(&config.id) {
                continue;
            }
            info!(
                uid = config.id,
                vnetwork = config.namespaced_name(),
                "Sweeping stale parent configuration"
            );
            self.delete_virtual_network(&config.id);
        }
    }

    /// Refresh the cached parent segments of one virtual network from
    /// a backend listing.
    async fn sync_parent_segments(&self, uid: &str) -> Result<(), ControllerError> {
        let tags = vec![Tag::new(TAG_SCOPE_VNETWORK_UID, uid)];
        let listing = self
            .client
            .search_resources(ResourceKind::Segment, &tags)
            .await?;
        let fresh = listing
            .into_iter()
            .map(Segment::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let existing = self
            .parent_segment_store
            .get_by_index(TAG_SCOPE_VNETWORK_UID, uid);
        let (_, mut stale) = compare_resources(&existing, &fresh);
        for segment in &mut stale {
            segment.marked_for_delete = true;
        }
        self.parent_segment_store
            .apply(fresh.into_iter().chain(stale));
        Ok(())
    }

    fn resolve_ip_block(&self, config: &ParentConfig) -> Option<String> {
        if self.project_scoped_blocks {
            let tier1 = self
                .tier1_store
                .get_by_index(INDEX_PATH, &config.tier1_path)
                .into_iter()
                .next()?;
            let project_uid = filter_tag_values(&tier1.tags, TAG_SCOPE_PROJECT_UID)
                .into_iter()
                .next()?;
            self.ip_block_store
                .get_by_index(TAG_SCOPE_PROJECT_UID, &project_uid)
                .into_iter()
                .find_map(|block| block.path)
        } else {
            self.ip_block_store
                .get_by_index(TAG_SCOPE_CLUSTER, &self.cluster)
                .into_iter()
                .find_map(|block| block.path)
        }
    }

    fn allocate_segment_vlan(
        &self,
        request: &ChildSubnetRequest,
        parent_config: &ParentConfig,
    ) -> Result<i64, ControllerError> {
        let mut used = HashSet::new();
        for path in &parent_config.segment_paths {
            for map in self
                .segment_binding_map_store
                .get_by_index(INDEX_SEGMENT_PATH, path)
            {
                used.extend(map.vlan_traffic_tag);
            }
        }
        next_vlan(&used).ok_or_else(|| {
            ControllerError::AllocationExhausted(format!(
                "no VLAN tag left for {}/{} across {} parent segments",
                request.namespace,
                request.name,
                parent_config.segment_paths.len()
            ))
        })
    }

    /// Best-effort compensating delete of a pool that was created but
    /// whose follow-on steps failed. Failure here is logged, never
    /// propagated; the caller reports the error that triggered the
    /// rollback.
    async fn roll_back_pool(&self, pool: &IpPool, pool_subnet: &IpPoolSubnet) {
        warn!(pool_id = pool.id, "Rolling back pool create");
        let mut pool = pool.clone();
        let mut pool_subnet = pool_subnet.clone();
        pool.marked_for_delete = true;
        pool_subnet.marked_for_delete = true;
        match wrap::wrap_hierarchy_ip_pool(&pool, &pool_subnet) {
            Ok(intent) => {
                if let Err(err) = self.client.patch_infra(&intent).await {
                    error!(pool_id = pool.id, %err, "Compensating pool delete failed");
                }
            }
            Err(err) => {
                error!(pool_id = pool.id, %err, "Failed to build compensating pool delete");
            }
        }
    }
}

impl std::fmt::Debug for SubnetService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetService")
            .field("cluster", &self.cluster)
            .field("project_scoped_blocks", &self.project_scoped_blocks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use policy_client::{
        MockPolicyClient, PolicyError, RealizedAttribute, RealizedEntity, TAG_SCOPE_NAMESPACE,
    };

    const BLOCK_PATH: &str = "/infra/ip-blocks/block-test";

    fn service_with(client: &MockPolicyClient) -> SubnetService {
        SubnetService::new(Arc::new(client.clone()), "cluster-a".to_string(), false)
            .realize_budget(0, Duration::ZERO)
    }

    fn parent_config() -> ParentConfig {
        ParentConfig {
            id: "v1".to_string(),
            name: "net1".to_string(),
            namespace: "default".to_string(),
            tier1_path: "/infra/tier-1s/t1".to_string(),
            transport_zone_path: "/infra/sites/default/transport-zones/tz".to_string(),
            segment_paths: ["/infra/segments/p1"].into_iter().map(String::from).collect(),
            public_ip_block_path: BLOCK_PATH.to_string(),
            private_ip_block_path: BLOCK_PATH.to_string(),
            marked_for_delete: false,
        }
    }

    fn request() -> ChildSubnetRequest {
        ChildSubnetRequest {
            uid: "u1".to_string(),
            namespace: "default".to_string(),
            name: "web".to_string(),
            parent: "net1".to_string(),
            prefix_length: 24,
            access_mode: AccessMode::Private,
        }
    }

    fn realized_pool_subnet(client: &MockPolicyClient) {
        client.set_realized(
            builders::ip_pool_subnet_intent_path("u1"),
            vec![RealizedEntity {
                entity_type: Some("IpBlockSubnet".to_string()),
                extended_attributes: vec![
                    RealizedAttribute {
                        key: "cidr".to_string(),
                        values: vec!["10.0.4.0/24".to_string()],
                    },
                    RealizedAttribute {
                        key: "gateway_ip".to_string(),
                        values: vec!["10.0.4.1".to_string()],
                    },
                ],
            }],
        );
    }

    #[tokio::test]
    async fn create_provisions_full_family() {
        let client = MockPolicyClient::new("http://mock");
        realized_pool_subnet(&client);
        let service = service_with(&client);
        service.parent_configs.apply([parent_config()]);

        let outcome = service.create_or_update_child_subnet(&request()).await.unwrap();
        assert_eq!(
            outcome,
            ChildSubnetOutcome::Provisioned {
                resource_path: "/infra/segments/cs_u1".to_string(),
                gateway_cidrs: vec!["10.0.4.1/24".to_string()],
                vlan: Some(1),
            }
        );

        // pool create, then the segment/binding/NAT family
        assert_eq!(client.infra_patches().len(), 2);
        assert!(service.child_segment_store.get_by_key("cs_u1").is_some());
        assert!(service.ip_pool_store.get_by_key("ipc_u1").is_some());
        assert_eq!(
            service
                .segment_binding_map_store
                .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, "u1")
                .len(),
            1
        );
        assert_eq!(
            service
                .nat_rule_store
                .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, "u1")
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn second_reconcile_writes_nothing() {
        let client = MockPolicyClient::new("http://mock");
        realized_pool_subnet(&client);
        let service = service_with(&client);
        service.parent_configs.apply([parent_config()]);

        service.create_or_update_child_subnet(&request()).await.unwrap();
        let patches_after_create = client.infra_patches().len();
        let outcome = service.create_or_update_child_subnet(&request()).await.unwrap();

        assert!(matches!(outcome, ChildSubnetOutcome::Provisioned { vlan: Some(1), .. }));
        assert_eq!(client.infra_patches().len(), patches_after_create);
    }

    #[tokio::test]
    async fn capacity_error_marks_block_exhausted() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);
        service.parent_configs.apply([parent_config()]);
        client.push_patch_failure(MockPolicyClient::capacity_error(BLOCK_PATH));

        let err = service.create_or_update_child_subnet(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::IpBlockExhausted { ref block_path } if block_path == BLOCK_PATH
        ));
        assert!(service.exhausted_blocks.contains(BLOCK_PATH));
        assert!(client.infra_patches().is_empty());
    }

    #[tokio::test]
    async fn segment_write_failure_rolls_back_the_pool() {
        let client = MockPolicyClient::new("http://mock");
        realized_pool_subnet(&client);
        let service = service_with(&client);
        service.parent_configs.apply([parent_config()]);
        client.push_patch_success();
        client.push_patch_failure(PolicyError::Api("backend unavailable".to_string()));

        let err = service.create_or_update_child_subnet(&request()).await.unwrap_err();
        assert!(matches!(err, ControllerError::Policy(_)));

        // pool create succeeded, then the compensating delete went out
        let patches = client.infra_patches();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1].children[0]["marked_for_delete"], true);
        assert!(service.child_segment_store.get_by_key("cs_u1").is_none());
        assert!(service.ip_pool_store.get_by_key("ipc_u1").is_none());
    }

    #[tokio::test]
    async fn realization_budget_exhaustion_rolls_back_and_is_neutral() {
        let client = MockPolicyClient::new("http://mock");
        // only the cidr realizes, never the gateway
        client.set_realized(
            builders::ip_pool_subnet_intent_path("u1"),
            vec![RealizedEntity {
                entity_type: Some("IpBlockSubnet".to_string()),
                extended_attributes: vec![RealizedAttribute {
                    key: "cidr".to_string(),
                    values: vec!["10.0.4.0/24".to_string()],
                }],
            }],
        );
        let service = service_with(&client);
        service.parent_configs.apply([parent_config()]);

        let outcome = service.create_or_update_child_subnet(&request()).await.unwrap();
        assert_eq!(outcome, ChildSubnetOutcome::NotRealized);
        // pool create plus its compensating delete
        assert_eq!(client.infra_patches().len(), 2);
    }

    #[tokio::test]
    async fn delete_tears_down_family_and_clears_exhaustion() {
        let client = MockPolicyClient::new("http://mock");
        realized_pool_subnet(&client);
        let service = service_with(&client);
        service.parent_configs.apply([parent_config()]);
        service.create_or_update_child_subnet(&request()).await.unwrap();
        service.exhausted_blocks.insert(BLOCK_PATH);

        service.delete_child_subnet("u1").await.unwrap();

        assert_eq!(client.infra_patches().len(), 3);
        assert!(service.child_segment_store.get_by_key("cs_u1").is_none());
        assert!(service.ip_pool_store.get_by_key("ipc_u1").is_none());
        assert!(service
            .segment_binding_map_store
            .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, "u1")
            .is_empty());
        assert!(!service.exhausted_blocks.contains(BLOCK_PATH));
    }

    #[tokio::test]
    async fn sweep_removes_families_without_a_live_owner() {
        let client = MockPolicyClient::new("http://mock");
        realized_pool_subnet(&client);
        let service = service_with(&client);
        service.parent_configs.apply([parent_config()]);
        service.create_or_update_child_subnet(&request()).await.unwrap();

        let live: HashSet<String> = ["u1".to_string()].into_iter().collect();
        service.sweep_stale_child_subnets(&live).await;
        assert!(service.child_segment_store.get_by_key("cs_u1").is_some());

        service.sweep_stale_child_subnets(&HashSet::new()).await;
        assert!(service.child_segment_store.get_by_key("cs_u1").is_none());
    }

    #[tokio::test]
    async fn sweep_drops_parent_configs_without_a_live_owner() {
        let client = MockPolicyClient::new("http://mock");
        let service = service_with(&client);
        service.parent_configs.apply([parent_config()]);

        let live: HashSet<String> = ["v1".to_string()].into_iter().collect();
        service.sweep_stale_virtual_networks(&live);
        assert!(service.parent_configs.get("v1").is_some());

        service.sweep_stale_virtual_networks(&HashSet::new());
        assert!(service.parent_configs.get("v1").is_none());
    }

    #[tokio::test]
    async fn virtual_network_resolution_builds_a_snapshot_once() {
        let client = MockPolicyClient::new("http://mock");
        client.add_resource(Segment {
            id: "p1".to_string(),
            connectivity_path: Some("/infra/tier-1s/t1".to_string()),
            transport_zone_path: Some("/infra/sites/default/transport-zones/tz".to_string()),
            tags: vec![Tag::new(TAG_SCOPE_VNETWORK_UID, "v1")],
            path: Some("/infra/segments/p1".to_string()),
            ..Segment::default()
        });
        client.add_resource(IpBlock {
            id: "shared".to_string(),
            tags: vec![Tag::new(TAG_SCOPE_CLUSTER, "cluster-a")],
            path: Some("/infra/ip-blocks/shared".to_string()),
            ..IpBlock::default()
        });
        let service = service_with(&client);
        service.init().await.unwrap();

        let vnet = VirtualNetworkRequest {
            uid: "v1".to_string(),
            namespace: "default".to_string(),
            name: "net1".to_string(),
        };
        assert!(service.create_or_update_virtual_network(&vnet).await.unwrap());
        let config = service.parent_configs.get("v1").unwrap();
        assert_eq!(config.tier1_path, "/infra/tier-1s/t1");
        assert_eq!(config.private_ip_block_path, "/infra/ip-blocks/shared");
        assert!(config.segment_paths.contains("/infra/segments/p1"));

        // same backend state again is a no-op
        assert!(!service.create_or_update_virtual_network(&vnet).await.unwrap());

        service.delete_virtual_network("v1");
        assert!(service.parent_configs.get("v1").is_none());
    }

    #[tokio::test]
    async fn update_reconverges_bindings_when_a_parent_is_removed() {
        let client = MockPolicyClient::new("http://mock");
        realized_pool_subnet(&client);
        let service = service_with(&client);
        let mut config = parent_config();
        config.segment_paths = ["/infra/segments/p1", "/infra/segments/p2"]
            .into_iter()
            .map(String::from)
            .collect();
        service.parent_configs.apply([config.clone()]);
        service.create_or_update_child_subnet(&request()).await.unwrap();
        assert_eq!(
            service
                .segment_binding_map_store
                .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, "u1")
                .len(),
            2
        );

        config.segment_paths.remove("/infra/segments/p2");
        service.parent_configs.apply([config]);
        service.create_or_update_child_subnet(&request()).await.unwrap();

        let maps = service
            .segment_binding_map_store
            .get_by_index(TAG_SCOPE_CHILD_SUBNET_UID, "u1");
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].id, "scbm_u1_p1");
        // vlan survives the reconvergence
        assert_eq!(maps[0].vlan_traffic_tag, Some(1));
    }

    #[test]
    fn validation_tags_carry_the_owner_identity() {
        let tags = builders::child_subnet_tags("cluster-a", "default", "web", "u1");
        assert!(tags.iter().any(|t| t.scope == TAG_SCOPE_NAMESPACE && t.tag == "default"));
        assert!(tags.iter().any(|t| t.scope == TAG_SCOPE_CHILD_SUBNET_UID && t.tag == "u1"));
    }
}
