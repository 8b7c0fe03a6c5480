//! Infra-rooted hierarchy assembly.
//!
//! Packs the child-subnet resource family (pool + block subnet,
//! segment + binding maps, tier1 + NAT section + rules) into one
//! `Infra` intent tree so the whole family reaches the backend in a
//! single atomic PATCH.

use policy_client::{
    Infra, IpPool, IpPoolSubnet, NatRule, NatSection, PolicyError, PolicyObject, Segment,
    SegmentBindingMap, Tier1, wrap_child,
};
use serde::Serialize;
use serde_json::{Value, json};

/// Wrap `resource` as a child node carrying already-wrapped children
/// of its own.
fn wrap_with_children<T: PolicyObject + Serialize>(
    resource: &T,
    children: Vec<Value>,
) -> Result<Value, PolicyError> {
    let mut wrapped = wrap_child(resource)?;
    if !children.is_empty() {
        wrapped[T::KIND.child_field()]["children"] = json!(children);
    }
    Ok(wrapped)
}

/// Pool with its block subnets nested inside.
pub fn wrap_ip_pool_and_subnets(
    pool: &IpPool,
    subnets: &[&IpPoolSubnet],
) -> Result<Value, PolicyError> {
    let children = subnets
        .iter()
        .map(|subnet| wrap_child(*subnet))
        .collect::<Result<Vec<_>, _>>()?;
    wrap_with_children(pool, children)
}

/// Segment with its connection binding maps nested inside.
pub fn wrap_segment_and_binding_maps(
    segment: &Segment,
    binding_maps: &[SegmentBindingMap],
) -> Result<Value, PolicyError> {
    let children = binding_maps
        .iter()
        .map(wrap_child)
        .collect::<Result<Vec<_>, _>>()?;
    wrap_with_children(segment, children)
}

/// Tier1 with the NAT section and its rules nested inside.
pub fn wrap_tier1_and_nat_rules(
    tier1: &Tier1,
    nat: &NatSection,
    rules: &[NatRule],
) -> Result<Value, PolicyError> {
    let rule_children = rules
        .iter()
        .map(wrap_child)
        .collect::<Result<Vec<_>, _>>()?;
    let nat_child = wrap_with_children(nat, rule_children)?;
    wrap_with_children(tier1, vec![nat_child])
}

/// The pool-only intent used for the first create step and for its
/// compensating delete.
pub fn wrap_hierarchy_ip_pool(
    pool: &IpPool,
    subnet: &IpPoolSubnet,
) -> Result<Infra, PolicyError> {
    Ok(Infra::new(vec![wrap_ip_pool_and_subnets(pool, &[subnet])?]))
}

/// The segment/binding/NAT intent applied after the pool subnet
/// realizes.
pub fn wrap_hierarchy_segment_and_nat(
    segment: &Segment,
    binding_maps: &[SegmentBindingMap],
    tier1: Option<&Tier1>,
    nat: &NatSection,
    rules: &[NatRule],
) -> Result<Infra, PolicyError> {
    let mut children = vec![wrap_segment_and_binding_maps(segment, binding_maps)?];
    if let Some(tier1) = tier1 {
        children.push(wrap_tier1_and_nat_rules(tier1, nat, rules)?);
    }
    Ok(Infra::new(children))
}

/// A segment-only intent, used when only the binding maps change.
pub fn wrap_hierarchy_child_segment(
    segment: &Segment,
    binding_maps: &[SegmentBindingMap],
) -> Result<Infra, PolicyError> {
    Ok(Infra::new(vec![wrap_segment_and_binding_maps(
        segment,
        binding_maps,
    )?]))
}

/// The full family in one tree. Absent members contribute nothing; an
/// empty tree yields `None`, signaling "nothing to send".
#[allow(clippy::too_many_arguments, reason = "one parameter per family member")]
pub fn wrap_hierarchy_infra(
    pool: Option<&IpPool>,
    subnet: Option<&IpPoolSubnet>,
    segment: Option<&Segment>,
    binding_maps: &[SegmentBindingMap],
    tier1: Option<&Tier1>,
    nat: &NatSection,
    rules: &[NatRule],
) -> Result<Option<Infra>, PolicyError> {
    let mut children = Vec::new();
    if let Some(pool) = pool {
        let subnets: Vec<&IpPoolSubnet> = subnet.into_iter().collect();
        children.push(wrap_ip_pool_and_subnets(pool, &subnets)?);
    }
    if let Some(segment) = segment {
        children.push(wrap_segment_and_binding_maps(segment, binding_maps)?);
    }
    if let Some(tier1) = tier1 {
        if !rules.is_empty() {
            children.push(wrap_tier1_and_nat_rules(tier1, nat, rules)?);
        }
    }
    if children.is_empty() {
        return Ok(None);
    }
    Ok(Some(Infra::new(children)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::service::builders;

    #[test]
    fn pool_tree_nests_subnet_under_pool() {
        let (pool, subnet) = builders::build_ip_pool_with_subnet(
            "u1",
            "web",
            "/infra/ip-blocks/block-test",
            24,
            &[],
        );
        let infra = wrap_hierarchy_ip_pool(&pool, &subnet).unwrap();
        assert_eq!(infra.resource_type, "Infra");
        assert_eq!(infra.children.len(), 1);
        let pool_node = &infra.children[0];
        assert_eq!(pool_node["resource_type"], "ChildIpAddressPool");
        assert_eq!(pool_node["id"], "ipc_u1");
        let nested = &pool_node["IpAddressPool"]["children"][0];
        assert_eq!(nested["resource_type"], "ChildIpAddressPoolSubnet");
        assert_eq!(nested["IpAddressPoolSubnet"]["id"], "ibs_u1");
        assert_eq!(nested["IpAddressPoolSubnet"]["size"], 256);
    }

    #[test]
    fn empty_family_yields_nothing_to_send() {
        let nat = builders::build_default_nat_section();
        let infra = wrap_hierarchy_infra(None, None, None, &[], None, &nat, &[]).unwrap();
        assert!(infra.is_none());
    }

    #[test]
    fn tier1_without_rules_is_omitted() {
        let nat = builders::build_default_nat_section();
        let tier1 = Tier1 {
            id: "t1".to_string(),
            ..Tier1::default()
        };
        let segment = Segment {
            id: "cs_u1".to_string(),
            ..Segment::default()
        };
        let infra = wrap_hierarchy_infra(None, None, Some(&segment), &[], Some(&tier1), &nat, &[])
            .unwrap()
            .unwrap();
        assert_eq!(infra.children.len(), 1);
        assert_eq!(infra.children[0]["resource_type"], "ChildSegment");
    }

    #[test]
    fn tombstoned_members_carry_the_flag_through_the_tree() {
        let (mut pool, mut subnet) = builders::build_ip_pool_with_subnet(
            "u1",
            "web",
            "/infra/ip-blocks/block-test",
            24,
            &[],
        );
        pool.marked_for_delete = true;
        subnet.marked_for_delete = true;
        let infra = wrap_hierarchy_ip_pool(&pool, &subnet).unwrap();
        let pool_node = &infra.children[0];
        assert_eq!(pool_node["marked_for_delete"], true);
        assert_eq!(
            pool_node["IpAddressPool"]["children"][0]["marked_for_delete"],
            true
        );
    }
}
