//! ChildSubnet Custom Resource Definition
//!
//! A ChildSubnet requests a subnet carved out of an upstream
//! VirtualNetwork: an IP pool backed by an IP block, a network
//! segment attached to the parent's routing tier, VLAN-tagged
//! bindings to every parent segment, and NAT rules for the carved
//! CIDR.

use crate::condition::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ChildSubnetSpec defines the desired state of a ChildSubnet
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.vnetops.io",
    version = "v1alpha1",
    kind = "ChildSubnet",
    namespaced,
    status = "ChildSubnetStatus",
    printcolumn = r#"{"name":"Parent", "type":"string", "jsonPath":".spec.parent"}"#,
    printcolumn = r#"{"name":"VLAN", "type":"integer", "jsonPath":".status.vlan"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChildSubnetSpec {
    /// Name of the upstream VirtualNetwork in the same namespace.
    pub parent: String,

    /// IP version of the requested subnet.
    #[serde(default)]
    pub ip_version: IpVersion,

    /// Prefix length of the requested subnet, sized from the
    /// estimated workload count.
    #[serde(default = "default_prefix_length")]
    pub subnet_prefix_length: u8,

    /// Whether the subnet is reachable from outside the virtual
    /// network.
    #[serde(default)]
    pub access_mode: AccessMode,
}

fn default_prefix_length() -> u8 {
    24
}

/// IP version choices for a ChildSubnet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    /// IPv4 only (the default).
    #[default]
    Ipv4,
    /// IPv6 only.
    Ipv6,
    /// Dual stack.
    Dual,
}

/// Access mode of a ChildSubnet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Reachable only from within the virtual network (the default).
    #[default]
    Private,
    /// Reachable from outside the virtual network; NAT is skipped.
    Public,
}

/// ChildSubnetStatus defines the observed state of a ChildSubnet
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChildSubnetStatus {
    /// Backend address path of the created segment (set after the
    /// first successful create).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_path: Option<String>,

    /// Gateway addresses in `$gateway/$prefixLength` form, one per
    /// address family.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,

    /// VLAN tag allocated for the parent segment bindings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,

    /// Status conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
