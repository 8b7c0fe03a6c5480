//! SubnetBinding Custom Resource Definition
//!
//! A SubnetBinding attaches one bound subnet to one or more parent
//! subnets at layer 2 with a VLAN traffic tag. The parents are either
//! listed explicitly by backend address path, resolved from a named
//! VirtualNetwork (every subnet of that network becomes a parent), or
//! resolved from a named subnet set (every backend subnet tagged with
//! the set name becomes a parent).

use crate::condition::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// SubnetBindingSpec defines the desired state of a SubnetBinding
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.vnetops.io",
    version = "v1alpha1",
    kind = "SubnetBinding",
    namespaced,
    status = "SubnetBindingStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"VLAN", "type":"integer", "jsonPath":".status.vlan"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetBindingSpec {
    /// Backend address path of the bound subnet.
    pub subnet_path: String,

    /// How the parent subnets are resolved.
    #[serde(rename = "type")]
    pub parent_type: ParentType,

    /// Backend address paths of the parent subnets. Set only when
    /// `type` is "subnets".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,

    /// Name of the VirtualNetwork or subnet set whose subnets become
    /// the parents. Set only when `type` is "virtualNetwork" or
    /// "subnetSet".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// VLAN traffic tag for the binding. When absent the controller
    /// allocates the smallest unused tag on the parents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,
}

/// Ways a SubnetBinding resolves its parent subnets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ParentType {
    /// An explicit list of parent subnet paths.
    Subnets,
    /// Every backend subnet tagged with a named subnet set.
    SubnetSet,
    /// Every subnet of a named upstream VirtualNetwork.
    VirtualNetwork,
}

/// SubnetBindingStatus defines the observed state of a SubnetBinding
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubnetBindingStatus {
    /// VLAN traffic tag in effect for the binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,

    /// Status conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
