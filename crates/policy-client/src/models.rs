//! Typed models for the policy API
//!
//! Every backend resource kind written by the controllers is modeled
//! here as an addressable, tag-annotated, optionally tombstoned
//! record. The tag list is the only durable link between a backend
//! resource and its owning Kubernetes object, so the tag scope
//! constants below are a compatibility surface: changing one orphans
//! every resource written under the old scope.

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Tag scope linking a resource to the owning cluster.
pub const TAG_SCOPE_CLUSTER: &str = "vnet-op/cluster";
/// Tag scope linking a resource to the owning ChildSubnet UID.
pub const TAG_SCOPE_CHILD_SUBNET_UID: &str = "vnet-op/child_subnet_uid";
/// Tag scope carrying the owning ChildSubnet name.
pub const TAG_SCOPE_CHILD_SUBNET_NAME: &str = "vnet-op/child_subnet_name";
/// Tag scope linking a segment to the upstream VirtualNetwork UID.
pub const TAG_SCOPE_VNETWORK_UID: &str = "vnet-op/vnetwork_uid";
/// Tag scope linking a resource to a backend project UID.
pub const TAG_SCOPE_PROJECT_UID: &str = "vnet-op/project_uid";
/// Tag scope carrying the Kubernetes namespace name.
pub const TAG_SCOPE_NAMESPACE: &str = "vnet-op/namespace";
/// Tag scope linking a binding map to the parent configuration it was
/// built from.
pub const TAG_SCOPE_PARENT_CONFIG_UID: &str = "vnet-op/parent_config_uid";
/// Tag scope linking a binding map to the owning SubnetBinding UID.
pub const TAG_SCOPE_SUBNET_BINDING_UID: &str = "vnet-op/subnet_binding_uid";
/// Tag scope grouping bound subnets into a named subnet set.
pub const TAG_SCOPE_SUBNET_SET: &str = "vnet-op/subnet_set";

/// One scope/value annotation on a backend resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    /// Namespaced scope name, e.g. `vnet-op/child_subnet_uid`
    pub scope: String,
    /// Value, empty when used as a wildcard in a search
    #[serde(default)]
    pub tag: String,
}

impl Tag {
    /// A scope/value tag.
    pub fn new(scope: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            tag: tag.into(),
        }
    }

    /// A scope-only tag, matching any value in a search.
    pub fn scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            tag: String::new(),
        }
    }
}

/// Values of every tag with the given scope, in tag-list order.
pub fn filter_tag_values(tags: &[Tag], scope: &str) -> Vec<String> {
    tags.iter()
        .filter(|t| t.scope == scope)
        .map(|t| t.tag.clone())
        .collect()
}

/// The closed set of backend resource kinds the controllers manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Address block subnets are carved from
    IpBlock,
    /// Address pool owning pool subnets
    IpPool,
    /// Subnet carved from an IP block into a pool
    IpPoolSubnet,
    /// Layer-2 network segment
    Segment,
    /// VLAN-tagged binding between segments
    SegmentBindingMap,
    /// Routing tier
    Tier1,
    /// NAT section on a routing tier
    NatSection,
    /// NAT rule inside a NAT section
    NatRule,
    /// Bound subnet inside a virtual network
    Subnet,
    /// VLAN-tagged binding between bound subnets
    SubnetBindingMap,
}

impl ResourceKind {
    /// Wire `resource_type` value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IpBlock => "IpAddressBlock",
            Self::IpPool => "IpAddressPool",
            Self::IpPoolSubnet => "IpAddressPoolBlockSubnet",
            Self::Segment => "Segment",
            Self::SegmentBindingMap => "SegmentConnectionBindingMap",
            Self::Tier1 => "Tier1",
            Self::NatSection => "PolicyNat",
            Self::NatRule => "PolicyNatRule",
            Self::Subnet => "Subnet",
            Self::SubnetBindingMap => "SubnetConnectionBindingMap",
        }
    }

    /// `resource_type` of the child wrapper used in hierarchical
    /// writes.
    pub fn child_type(self) -> &'static str {
        match self {
            Self::IpBlock => "ChildIpAddressBlock",
            Self::IpPool => "ChildIpAddressPool",
            Self::IpPoolSubnet => "ChildIpAddressPoolSubnet",
            Self::Segment => "ChildSegment",
            Self::SegmentBindingMap => "ChildSegmentConnectionBindingMap",
            Self::Tier1 => "ChildTier1",
            Self::NatSection => "ChildPolicyNat",
            Self::NatRule => "ChildPolicyNatRule",
            Self::Subnet => "ChildSubnet",
            Self::SubnetBindingMap => "ChildSubnetConnectionBindingMap",
        }
    }

    /// Field of the child wrapper carrying the embedded resource.
    pub fn child_field(self) -> &'static str {
        match self {
            // The wrapper field name predates the block-subnet split
            // on the backend and does not match the resource type.
            Self::IpPoolSubnet => "IpAddressPoolSubnet",
            other => other.as_str(),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accessors shared by every backend resource struct.
pub trait PolicyObject: Clone + Send + Sync + 'static {
    /// The resource kind of this type.
    const KIND: ResourceKind;

    /// Stable backend id, derived from the owning CR identity.
    fn id(&self) -> &str;
    /// Tag annotations.
    fn tags(&self) -> &[Tag];
    /// Tombstone flag.
    fn marked_for_delete(&self) -> bool;
    /// Backend-assigned hierarchical address, present only after the
    /// first successful create.
    fn path(&self) -> Option<&str>;
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Address block subnets are carved from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IpBlock {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// CIDR of the block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// Address pool owning pool subnets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IpPool {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// Subnet carved from an IP block into a pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IpPoolSubnet {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Address of the block this subnet is carved from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block_path: Option<String>,
    /// Requested size in addresses (a power of two)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// One gateway entry of a segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SegmentSubnet {
    /// Gateway in `$address/$prefixLength` form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<String>,
}

/// Advanced configuration of a segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SegmentAdvancedConfig {
    /// Address pools backing the segment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address_pool_paths: Vec<String>,
}

/// Layer-2 network segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Address of the routing tier the segment attaches to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity_path: Option<String>,
    /// Address of the transport zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_zone_path: Option<String>,
    /// Gateway entries, one per address family
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SegmentSubnet>,
    /// Advanced configuration (address pools)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced_config: Option<SegmentAdvancedConfig>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// VLAN-tagged binding attaching a child segment to a parent segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SegmentBindingMap {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Address of the parent segment being bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_path: Option<String>,
    /// VLAN traffic tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_traffic_tag: Option<i64>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Address of the containing child segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// Routing tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Tier1 {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// NAT section on a routing tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NatSection {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// NAT section type, e.g. `DEFAULT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<String>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// NAT rule action applied to traffic matching the rule.
pub mod nat_action {
    /// Source NAT
    pub const SNAT: &str = "SNAT";
    /// Exempt matching traffic from NAT
    pub const NO_SNAT: &str = "NO_SNAT";
}

/// NAT rule inside a NAT section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NatRule {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Rule action, see [`nat_action`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Source network CIDR the rule matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_network: Option<String>,
    /// Destination network CIDR the rule matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_network: Option<String>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// Bound subnet inside a virtual network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Subnet {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// VLAN-tagged binding attaching one bound subnet to a parent subnet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubnetBindingMap {
    /// Stable backend id
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Address of the parent subnet being bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_path: Option<String>,
    /// VLAN traffic tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_traffic_tag: Option<i64>,
    /// Tag annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Backend-assigned address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Address of the containing child subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    /// Tombstone flag
    #[serde(default, skip_serializing_if = "is_false")]
    pub marked_for_delete: bool,
}

/// Any backend resource a tag search can return, discriminated by the
/// wire `resource_type` field. Adding a kind means adding a variant
/// here and a struct above; every store and builder match is then
/// compile-checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "resource_type")]
#[allow(
    clippy::large_enum_variant,
    reason = "listings are short-lived; variants are moved into typed stores immediately"
)]
pub enum PolicyResource {
    /// An IP address block
    IpAddressBlock(IpBlock),
    /// An IP address pool
    IpAddressPool(IpPool),
    /// A pool subnet carved from a block
    IpAddressPoolBlockSubnet(IpPoolSubnet),
    /// A network segment
    Segment(Segment),
    /// A segment connection binding map
    SegmentConnectionBindingMap(SegmentBindingMap),
    /// A routing tier
    Tier1(Tier1),
    /// A NAT section
    PolicyNat(NatSection),
    /// A NAT rule
    PolicyNatRule(NatRule),
    /// A bound subnet
    Subnet(Subnet),
    /// A subnet connection binding map
    SubnetConnectionBindingMap(SubnetBindingMap),
}

impl PolicyResource {
    /// The kind of the wrapped resource.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::IpAddressBlock(_) => ResourceKind::IpBlock,
            Self::IpAddressPool(_) => ResourceKind::IpPool,
            Self::IpAddressPoolBlockSubnet(_) => ResourceKind::IpPoolSubnet,
            Self::Segment(_) => ResourceKind::Segment,
            Self::SegmentConnectionBindingMap(_) => ResourceKind::SegmentBindingMap,
            Self::Tier1(_) => ResourceKind::Tier1,
            Self::PolicyNat(_) => ResourceKind::NatSection,
            Self::PolicyNatRule(_) => ResourceKind::NatRule,
            Self::Subnet(_) => ResourceKind::Subnet,
            Self::SubnetConnectionBindingMap(_) => ResourceKind::SubnetBindingMap,
        }
    }

    /// Tags of the wrapped resource.
    pub fn tags(&self) -> &[Tag] {
        match self {
            Self::IpAddressBlock(r) => &r.tags,
            Self::IpAddressPool(r) => &r.tags,
            Self::IpAddressPoolBlockSubnet(r) => &r.tags,
            Self::Segment(r) => &r.tags,
            Self::SegmentConnectionBindingMap(r) => &r.tags,
            Self::Tier1(r) => &r.tags,
            Self::PolicyNat(r) => &r.tags,
            Self::PolicyNatRule(r) => &r.tags,
            Self::Subnet(r) => &r.tags,
            Self::SubnetConnectionBindingMap(r) => &r.tags,
        }
    }
}

macro_rules! policy_object {
    ($ty:ident, $kind:expr, $variant:ident) => {
        impl PolicyObject for $ty {
            const KIND: ResourceKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn tags(&self) -> &[Tag] {
                &self.tags
            }

            fn marked_for_delete(&self) -> bool {
                self.marked_for_delete
            }

            fn path(&self) -> Option<&str> {
                self.path.as_deref()
            }
        }

        impl From<$ty> for PolicyResource {
            fn from(value: $ty) -> Self {
                PolicyResource::$variant(value)
            }
        }

        impl TryFrom<PolicyResource> for $ty {
            type Error = PolicyError;

            fn try_from(value: PolicyResource) -> Result<Self, Self::Error> {
                match value {
                    PolicyResource::$variant(v) => Ok(v),
                    other => Err(PolicyError::UnexpectedKind {
                        expected: $kind.as_str(),
                        got: other.kind().as_str(),
                    }),
                }
            }
        }
    };
}

policy_object!(IpBlock, ResourceKind::IpBlock, IpAddressBlock);
policy_object!(IpPool, ResourceKind::IpPool, IpAddressPool);
policy_object!(
    IpPoolSubnet,
    ResourceKind::IpPoolSubnet,
    IpAddressPoolBlockSubnet
);
policy_object!(Segment, ResourceKind::Segment, Segment);
policy_object!(
    SegmentBindingMap,
    ResourceKind::SegmentBindingMap,
    SegmentConnectionBindingMap
);
policy_object!(Tier1, ResourceKind::Tier1, Tier1);
policy_object!(NatSection, ResourceKind::NatSection, PolicyNat);
policy_object!(NatRule, ResourceKind::NatRule, PolicyNatRule);
policy_object!(Subnet, ResourceKind::Subnet, Subnet);
policy_object!(
    SubnetBindingMap,
    ResourceKind::SubnetBindingMap,
    SubnetConnectionBindingMap
);

/// Serialize a resource into its wire form with `resource_type` set.
pub fn to_wire_value<T: PolicyObject + Serialize>(resource: &T) -> Result<Value, PolicyError> {
    let mut value = serde_json::to_value(resource)?;
    value["resource_type"] = json!(T::KIND.as_str());
    Ok(value)
}

/// Wrap a resource into the typed child wrapper used in hierarchical
/// writes.
pub fn wrap_child<T: PolicyObject + Serialize>(resource: &T) -> Result<Value, PolicyError> {
    let kind = T::KIND;
    let mut wrapper = json!({
        "resource_type": kind.child_type(),
        "id": resource.id(),
    });
    if resource.marked_for_delete() {
        wrapper["marked_for_delete"] = json!(true);
    }
    wrapper[kind.child_field()] = to_wire_value(resource)?;
    Ok(wrapper)
}

/// Wrap already-serialized children under a typed ancestor reference.
pub fn wrap_child_resource_reference(
    target_type: &str,
    id: &str,
    children: Vec<Value>,
) -> Value {
    json!({
        "resource_type": "ChildResourceReference",
        "id": id,
        "target_type": target_type,
        "children": children,
    })
}

/// The infra intent root. The outermost layer of a hierarchical
/// write; carries no id of its own.
#[derive(Debug, Clone, Serialize)]
pub struct Infra {
    /// Always `Infra`
    pub resource_type: &'static str,
    /// Serialized child wrappers
    pub children: Vec<Value>,
}

impl Infra {
    /// An infra root over the given children.
    pub fn new(children: Vec<Value>) -> Self {
        Self {
            resource_type: "Infra",
            children,
        }
    }
}

/// The org intent root, used for writes addressed below
/// organizations.
#[derive(Debug, Clone, Serialize)]
pub struct OrgRoot {
    /// Always `OrgRoot`
    pub resource_type: &'static str,
    /// Serialized child wrappers
    pub children: Vec<Value>,
}

impl OrgRoot {
    /// An org root over the given children.
    pub fn new(children: Vec<Value>) -> Self {
        Self {
            resource_type: "OrgRoot",
            children,
        }
    }
}

/// One realized entity returned by the realized-state endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealizedEntity {
    /// Backend entity type, e.g. `IpBlockSubnet`
    #[serde(default)]
    pub entity_type: Option<String>,
    /// Backend-computed attributes
    #[serde(default)]
    pub extended_attributes: Vec<RealizedAttribute>,
}

/// One attribute of a realized entity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealizedAttribute {
    /// Attribute key, e.g. `cidr` or `gateway_ip`
    pub key: String,
    /// Attribute values
    #[serde(default)]
    pub values: Vec<String>,
}

impl RealizedEntity {
    /// First value of the attribute with the given key.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.extended_attributes
            .iter()
            .find(|a| a.key == key)
            .and_then(|a| a.values.first())
            .map(String::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn listing_roundtrips_through_resource_type_tag() {
        let raw = serde_json::json!({
            "resource_type": "Segment",
            "id": "cs_u1",
            "display_name": "cs-child",
            "path": "/infra/segments/cs_u1",
            "tags": [{"scope": TAG_SCOPE_CHILD_SUBNET_UID, "tag": "u1"}],
        });
        let resource: PolicyResource = serde_json::from_value(raw).unwrap();
        assert_eq!(resource.kind(), ResourceKind::Segment);
        let segment = Segment::try_from(resource).unwrap();
        assert_eq!(segment.id, "cs_u1");
        assert_eq!(segment.path.as_deref(), Some("/infra/segments/cs_u1"));
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let resource = PolicyResource::from(Tier1 {
            id: "t1".to_string(),
            ..Tier1::default()
        });
        let err = Segment::try_from(resource).unwrap_err();
        assert!(matches!(err, PolicyError::UnexpectedKind { expected: "Segment", got: "Tier1" }));
    }

    #[test]
    fn child_wrapper_embeds_resource_under_kind_field() {
        let subnet = IpPoolSubnet {
            id: "ibs_u1".to_string(),
            ip_block_path: Some("/infra/ip-blocks/block-test".to_string()),
            size: Some(256),
            marked_for_delete: true,
            ..IpPoolSubnet::default()
        };
        let wrapped = wrap_child(&subnet).unwrap();
        assert_eq!(wrapped["resource_type"], "ChildIpAddressPoolSubnet");
        assert_eq!(wrapped["marked_for_delete"], true);
        assert_eq!(
            wrapped["IpAddressPoolSubnet"]["resource_type"],
            "IpAddressPoolBlockSubnet"
        );
        assert_eq!(wrapped["IpAddressPoolSubnet"]["size"], 256);
    }

    #[test]
    fn tag_filter_ignores_other_scopes() {
        let tags = vec![
            Tag::new(TAG_SCOPE_CLUSTER, "cl1"),
            Tag::new(TAG_SCOPE_CHILD_SUBNET_UID, "u1"),
        ];
        assert_eq!(filter_tag_values(&tags, TAG_SCOPE_CHILD_SUBNET_UID), ["u1"]);
        assert!(filter_tag_values(&tags, TAG_SCOPE_PROJECT_UID).is_empty());
    }
}
