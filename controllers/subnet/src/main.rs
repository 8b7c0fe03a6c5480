//! vnetops subnet controller
//!
//! Reconciles three CRDs against a policy-style network backend:
//! - VirtualNetwork: discovers the upstream network's backend segments
//!   and derives a parent configuration snapshot
//! - ChildSubnet: carves an IP pool, segment, VLAN-tagged parent
//!   bindings and NAT rules out of the upstream network
//! - SubnetBinding: stitches layer-2 binding maps between subnets

mod controller;
mod error;
mod reconciler;
mod service;

use crate::error::ControllerError;
use controller::{Config, VnetController};
use std::env;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting vnetops subnet controller");

    // Load configuration from environment variables
    let policy_url = env::var("POLICY_API_URL")
        .unwrap_or_else(|_| "https://policy-api.vnetops:443".to_string());
    let policy_token = env::var("POLICY_API_TOKEN").map_err(|_| {
        ControllerError::InvalidConfig(
            "POLICY_API_TOKEN environment variable is required".to_string(),
        )
    })?;
    let cluster = env::var("CLUSTER_NAME").map_err(|_| {
        ControllerError::InvalidConfig("CLUSTER_NAME environment variable is required".to_string())
    })?;
    let namespace = env::var("WATCH_NAMESPACE").ok();
    let project_scoped_blocks = env::var("PROJECT_SCOPED_BLOCKS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    info!("Configuration:");
    info!("  Policy API URL: {}", policy_url);
    info!("  Cluster: {}", cluster);
    info!(
        "  Namespace: {}",
        namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Project-scoped IP blocks: {}", project_scoped_blocks);

    let controller = VnetController::new(Config {
        policy_url,
        policy_token,
        cluster,
        namespace,
        project_scoped_blocks,
    })
    .await?;
    controller.run().await?;

    Ok(())
}
