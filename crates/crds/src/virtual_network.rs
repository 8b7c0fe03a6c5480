//! VirtualNetwork Custom Resource Definition
//!
//! The upstream network a ChildSubnet carves from. Its backend
//! segments are discovered by tag, not declared here; the spec only
//! carries identity and an optional description. The controller
//! derives a parent configuration snapshot (routing tier, transport
//! zone, segment paths, IP block paths) from the tagged backend
//! state.

use crate::condition::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VirtualNetworkSpec defines the desired state of a VirtualNetwork
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "networking.vnetops.io",
    version = "v1alpha1",
    kind = "VirtualNetwork",
    namespaced,
    status = "VirtualNetworkStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualNetworkSpec {
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// VirtualNetworkStatus defines the observed state of a VirtualNetwork
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualNetworkStatus {
    /// Status conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
