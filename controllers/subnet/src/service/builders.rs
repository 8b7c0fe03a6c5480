//! Deterministic construction of backend resources from CR identity.
//!
//! Every backend id is recomputable from the owning CR's UID plus a
//! kind prefix, so re-running a builder for the same CR always yields
//! the same id. Ids are never stored and regenerated on every
//! reconcile.

use super::parent::ParentConfig;
use crds::AccessMode;
use ipnetwork::IpNetwork;
use policy_client::{
    IpPool, IpPoolSubnet, NatRule, NatSection, Segment, SegmentAdvancedConfig, SegmentBindingMap,
    SegmentSubnet, TAG_SCOPE_CHILD_SUBNET_NAME, TAG_SCOPE_CHILD_SUBNET_UID, TAG_SCOPE_CLUSTER,
    TAG_SCOPE_NAMESPACE, TAG_SCOPE_PARENT_CONFIG_UID, TAG_SCOPE_SUBNET_BINDING_UID, Tag,
    nat_action,
};

pub(crate) const IP_POOL_PREFIX: &str = "ipc";
pub(crate) const IP_POOL_SUBNET_PREFIX: &str = "ibs";
pub(crate) const CHILD_SEGMENT_PREFIX: &str = "cs";
pub(crate) const SEGMENT_BINDING_MAP_PREFIX: &str = "scbm";
pub(crate) const NAT_RULE_PREFIX: &str = "pnr";
pub(crate) const SUBNET_BINDING_MAP_PREFIX: &str = "sbm";
pub(crate) const DEFAULT_NAT: &str = "DEFAULT";

/// `{prefix}_{uid}[_{extra}][_{index}]`.
pub fn generate_id(uid: &str, prefix: &str, extra: &str, index: &str) -> String {
    let mut id = format!("{prefix}_{uid}");
    if !extra.is_empty() {
        id.push('_');
        id.push_str(extra);
    }
    if !index.is_empty() {
        id.push('_');
        id.push_str(index);
    }
    id
}

/// `{prefix}-{name}[-{extra}]`.
pub fn generate_display_name(name: &str, prefix: &str, extra: &str) -> String {
    let mut display = format!("{prefix}-{name}");
    if !extra.is_empty() {
        display.push('-');
        display.push_str(extra);
    }
    display
}

/// Number of addresses in an IPv4 subnet of the given prefix length.
pub fn subnet_size(prefix_length: u8) -> i64 {
    1_i64 << (32 - i64::from(prefix_length.min(32)))
}

/// Last path segment of a backend address.
pub fn id_from_path(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// The cluster, namespace, name, and owner-UID tags every resource
/// owned by a ChildSubnet carries.
pub fn child_subnet_tags(cluster: &str, namespace: &str, name: &str, uid: &str) -> Vec<Tag> {
    vec![
        Tag::new(TAG_SCOPE_CLUSTER, cluster),
        Tag::new(TAG_SCOPE_NAMESPACE, namespace),
        Tag::new(TAG_SCOPE_CHILD_SUBNET_NAME, name),
        Tag::new(TAG_SCOPE_CHILD_SUBNET_UID, uid),
    ]
}

/// Ownership tags for resources owned by a SubnetBinding.
pub fn subnet_binding_tags(cluster: &str, namespace: &str, uid: &str) -> Vec<Tag> {
    vec![
        Tag::new(TAG_SCOPE_CLUSTER, cluster),
        Tag::new(TAG_SCOPE_NAMESPACE, namespace),
        Tag::new(TAG_SCOPE_SUBNET_BINDING_UID, uid),
    ]
}

pub fn ip_pool_id(uid: &str) -> String {
    generate_id(uid, IP_POOL_PREFIX, "", "")
}

pub fn ip_pool_subnet_id(uid: &str) -> String {
    generate_id(uid, IP_POOL_SUBNET_PREFIX, "", "")
}

pub fn segment_id(uid: &str) -> String {
    generate_id(uid, CHILD_SEGMENT_PREFIX, "", "")
}

pub fn segment_binding_map_id(uid: &str, parent_id: &str) -> String {
    generate_id(uid, SEGMENT_BINDING_MAP_PREFIX, parent_id, "")
}

pub fn nat_rule_id(uid: &str, index: usize) -> String {
    generate_id(uid, NAT_RULE_PREFIX, "", &index.to_string())
}

pub fn subnet_binding_map_id(uid: &str, parent_id: &str) -> String {
    generate_id(uid, SUBNET_BINDING_MAP_PREFIX, parent_id, "")
}

pub fn ip_pool_intent_path(uid: &str) -> String {
    format!("/infra/ip-pools/{}", ip_pool_id(uid))
}

pub fn ip_pool_subnet_intent_path(uid: &str) -> String {
    format!(
        "/infra/ip-pools/{}/ip-subnets/{}",
        ip_pool_id(uid),
        ip_pool_subnet_id(uid)
    )
}

pub fn segment_intent_path(uid: &str) -> String {
    format!("/infra/segments/{}", segment_id(uid))
}

/// The address pool and the block subnet carved into it.
pub fn build_ip_pool_with_subnet(
    uid: &str,
    name: &str,
    ip_block_path: &str,
    prefix_length: u8,
    tags: &[Tag],
) -> (IpPool, IpPoolSubnet) {
    let pool = IpPool {
        id: ip_pool_id(uid),
        display_name: Some(generate_display_name(name, IP_POOL_PREFIX, "")),
        tags: tags.to_vec(),
        ..IpPool::default()
    };
    let subnet = IpPoolSubnet {
        id: ip_pool_subnet_id(uid),
        display_name: Some(generate_display_name(name, IP_POOL_SUBNET_PREFIX, "")),
        ip_block_path: Some(ip_block_path.to_string()),
        size: Some(subnet_size(prefix_length)),
        tags: tags.to_vec(),
        ..IpPoolSubnet::default()
    };
    (pool, subnet)
}

/// The child segment, attached to the parent's routing tier and
/// transport zone and backed by the child's address pool.
pub fn build_segment(
    uid: &str,
    name: &str,
    parent_config: &ParentConfig,
    ip_pool_path: &str,
    gateways: &[String],
    tags: &[Tag],
) -> Segment {
    Segment {
        id: segment_id(uid),
        display_name: Some(generate_display_name(name, CHILD_SEGMENT_PREFIX, "")),
        connectivity_path: Some(parent_config.tier1_path.clone()),
        transport_zone_path: Some(parent_config.transport_zone_path.clone()),
        subnets: gateways
            .iter()
            .map(|gateway| SegmentSubnet {
                gateway_address: Some(gateway.clone()),
            })
            .collect(),
        advanced_config: Some(SegmentAdvancedConfig {
            address_pool_paths: vec![ip_pool_path.to_string()],
        }),
        tags: tags.to_vec(),
        ..Segment::default()
    }
}

/// One binding map per parent segment path, all carrying the same
/// VLAN tag plus a parent-config correlation tag.
pub fn build_segment_binding_maps(
    uid: &str,
    name: &str,
    parent_config: &ParentConfig,
    vlan: i64,
    tags: &[Tag],
) -> Vec<SegmentBindingMap> {
    let mut map_tags = tags.to_vec();
    map_tags.push(Tag::new(TAG_SCOPE_PARENT_CONFIG_UID, &parent_config.id));
    parent_config
        .segment_paths
        .iter()
        .map(|parent_path| {
            let parent_id = id_from_path(parent_path);
            SegmentBindingMap {
                id: segment_binding_map_id(uid, parent_id),
                display_name: Some(generate_display_name(
                    name,
                    SEGMENT_BINDING_MAP_PREFIX,
                    parent_id,
                )),
                segment_path: Some(parent_path.clone()),
                vlan_traffic_tag: Some(vlan),
                tags: map_tags.clone(),
                ..SegmentBindingMap::default()
            }
        })
        .collect()
}

/// The default NAT section every SNAT rule hangs off.
pub fn build_default_nat_section() -> NatSection {
    NatSection {
        id: DEFAULT_NAT.to_string(),
        display_name: Some(DEFAULT_NAT.to_string()),
        nat_type: Some(DEFAULT_NAT.to_string()),
        ..NatSection::default()
    }
}

/// A source and a destination rule per subnet CIDR. Public subnets
/// are exempted from SNAT, private ones are translated.
pub fn build_nat_rules(
    uid: &str,
    name: &str,
    access_mode: AccessMode,
    networks: &[IpNetwork],
    tags: &[Tag],
) -> Vec<NatRule> {
    let action = match access_mode {
        AccessMode::Public => nat_action::NO_SNAT,
        AccessMode::Private => nat_action::SNAT,
    };
    let mut rules = Vec::with_capacity(networks.len() * 2);
    for (i, network) in networks.iter().enumerate() {
        let base = i * 2;
        rules.push(NatRule {
            id: nat_rule_id(uid, base),
            display_name: Some(generate_display_name(name, NAT_RULE_PREFIX, &base.to_string())),
            action: Some(action.to_string()),
            source_network: Some(network.to_string()),
            tags: tags.to_vec(),
            ..NatRule::default()
        });
        rules.push(NatRule {
            id: nat_rule_id(uid, base + 1),
            display_name: Some(generate_display_name(
                name,
                NAT_RULE_PREFIX,
                &(base + 1).to_string(),
            )),
            action: Some(action.to_string()),
            destination_network: Some(network.to_string()),
            tags: tags.to_vec(),
            ..NatRule::default()
        });
    }
    rules
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_deterministic_and_prefixed() {
        assert_eq!(ip_pool_subnet_id("u1"), "ibs_u1");
        assert_eq!(segment_binding_map_id("u1", "p1"), "scbm_u1_p1");
        assert_eq!(nat_rule_id("u1", 3), "pnr_u1_3");
        assert_eq!(generate_id("u1", "ibs", "s1", ""), "ibs_u1_s1");
    }

    #[test]
    fn intent_paths_compose_from_ids() {
        assert_eq!(
            ip_pool_subnet_intent_path("u1"),
            "/infra/ip-pools/ipc_u1/ip-subnets/ibs_u1"
        );
        assert_eq!(segment_intent_path("u1"), "/infra/segments/cs_u1");
    }

    #[test]
    fn subnet_size_follows_prefix_length() {
        assert_eq!(subnet_size(24), 256);
        assert_eq!(subnet_size(28), 16);
        assert_eq!(subnet_size(32), 1);
    }

    #[test]
    fn binding_maps_cover_every_parent_segment() {
        let parent_config = ParentConfig {
            id: "v1".to_string(),
            segment_paths: ["/infra/segments/p1", "/infra/segments/p2"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..ParentConfig::default()
        };
        let maps = build_segment_binding_maps("u1", "web", &parent_config, 7, &[]);
        assert_eq!(maps.len(), 2);
        let ids: Vec<&str> = maps.iter().map(|m| m.id.as_str()).collect();
        assert!(ids.contains(&"scbm_u1_p1"));
        assert!(ids.contains(&"scbm_u1_p2"));
        assert!(maps.iter().all(|m| m.vlan_traffic_tag == Some(7)));
        assert!(maps.iter().all(|m| {
            m.tags
                .iter()
                .any(|t| t.scope == TAG_SCOPE_PARENT_CONFIG_UID && t.tag == "v1")
        }));
    }

    #[test]
    fn nat_rules_pair_source_and_destination() {
        let network: IpNetwork = "10.0.4.0/24".parse().unwrap();
        let rules = build_nat_rules("u1", "web", AccessMode::Private, &[network], &[]);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "pnr_u1_0");
        assert_eq!(rules[0].source_network.as_deref(), Some("10.0.4.0/24"));
        assert_eq!(rules[0].destination_network, None);
        assert_eq!(rules[1].id, "pnr_u1_1");
        assert_eq!(rules[1].destination_network.as_deref(), Some("10.0.4.0/24"));
        assert!(rules.iter().all(|r| r.action.as_deref() == Some("SNAT")));

        let public = build_nat_rules("u1", "web", AccessMode::Public, &[network], &[]);
        assert!(public.iter().all(|r| r.action.as_deref() == Some("NO_SNAT")));
    }
}
