//! Prints the vnetops CRD manifests as a multi-document YAML stream.
//!
//! Usage: `cargo run --bin crdgen > deploy/crds.yaml`

use crds::{ChildSubnet, SubnetBinding, VirtualNetwork};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&ChildSubnet::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&SubnetBinding::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&VirtualNetwork::crd())?);
    Ok(())
}
