//! vnetops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the vnetops subnet
//! controller:
//! - `ChildSubnet`: a subnet carved out of an upstream virtual network
//! - `SubnetBinding`: a layer-2 binding between subnets
//! - `VirtualNetwork`: the upstream network a ChildSubnet attaches to

pub mod child_subnet;
pub mod condition;
pub mod subnet_binding;
pub mod virtual_network;

pub use child_subnet::*;
pub use condition::*;
pub use subnet_binding::*;
pub use virtual_network::*;
