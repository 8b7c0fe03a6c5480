//! VLAN allocation, IP-block exhaustion tracking, and realized-state
//! polling.

use crate::error::ControllerError;
use ipnetwork::IpNetwork;
use policy_client::{PolicyClientTrait, PolicyError, RealizedEntity};
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{LazyLock, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Smallest assignable VLAN traffic tag.
pub const VLAN_MIN: i64 = 1;
/// Largest assignable VLAN traffic tag.
pub const VLAN_MAX: i64 = 4094;

/// Backend error code for an IP block with no spare capacity.
pub const IP_BLOCK_EXHAUSTED_CODE: i64 = 520012;

/// Number of realized-state reads before giving up for this cycle.
pub const REALIZE_MAX_RETRIES: u32 = 3;
/// Wait between realized-state reads.
pub const REALIZE_RETRY_DELAY: Duration = Duration::from_secs(30);

static BLOCK_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used, reason = "pattern is a literal, checked by tests")]
    Regex::new(r"path=\[([^\]]+)\]").unwrap()
});

/// Smallest VLAN tag in [`VLAN_MIN`, `VLAN_MAX`] not in `used`,
/// `None` when the range is exhausted.
pub fn next_vlan(used: &HashSet<i64>) -> Option<i64> {
    (VLAN_MIN..=VLAN_MAX).find(|vlan| !used.contains(vlan))
}

/// Set of IP-block paths currently believed to be out of capacity.
///
/// Advisory only: allocation never hard-blocks on membership, the set
/// informs logging and backoff. A path is inserted when the backend
/// reports the capacity error and removed when a pool subnet carved
/// from the block is deleted.
#[derive(Debug, Default)]
pub struct ExhaustedBlocks {
    paths: RwLock<HashSet<String>>,
}

impl ExhaustedBlocks {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a block as exhausted. Re-insertion is a no-op; the path
    /// is logged only on first insertion.
    pub fn insert(&self, path: &str) {
        let mut paths = self.write();
        if paths.insert(path.to_string()) {
            info!(block_path = path, "IP block marked exhausted");
        }
    }

    /// Forget a block. Removing an absent path is a no-op.
    pub fn remove(&self, path: &str) {
        if self.write().remove(path) {
            info!(block_path = path, "IP block no longer exhausted");
        }
    }

    /// Whether the block is currently believed exhausted.
    pub fn contains(&self, path: &str) -> bool {
        self.read().contains(path)
    }

    /// Number of blocks believed exhausted.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no block is believed exhausted.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[allow(clippy::unwrap_used, reason = "set lock is never poisoned: no panics under it")]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashSet<String>> {
        self.paths.read().unwrap()
    }

    #[allow(clippy::unwrap_used, reason = "set lock is never poisoned: no panics under it")]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
        self.paths.write().unwrap()
    }
}

/// Extract the exhausted block path from a capacity-class API error.
///
/// The backend embeds the offending path in the error text as
/// `path=[/infra/ip-blocks/...]`, either on the top-level error or in
/// a related error entry. Returns `None` for any other error shape.
pub fn extract_exhausted_block(error: &PolicyError) -> Option<String> {
    let PolicyError::ApiDetail(detail) = error else {
        return None;
    };

    let mut candidates = Vec::new();
    if detail.error_code == Some(IP_BLOCK_EXHAUSTED_CODE) {
        candidates.extend(detail.error_message.as_deref());
    }
    for related in &detail.related_errors {
        if related.error_code == Some(IP_BLOCK_EXHAUSTED_CODE) {
            candidates.extend(related.error_message.as_deref());
        }
    }

    candidates.iter().find_map(|message| {
        BLOCK_PATH_RE
            .captures(message)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

/// Backend-computed values of a realized pool subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealizedSubnet {
    /// Carved CIDR
    pub cidr: IpNetwork,
    /// Gateway address inside the CIDR
    pub gateway: IpAddr,
}

impl RealizedSubnet {
    /// Gateway in `$address/$prefixLength` form, usable as a segment
    /// gateway entry.
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.cidr.prefix())
    }
}

fn realized_subnet_from(entities: &[RealizedEntity]) -> Option<RealizedSubnet> {
    for entity in entities {
        if entity.entity_type.as_deref() != Some("IpBlockSubnet") {
            continue;
        }
        let cidr = entity.attribute("cidr").and_then(|v| v.parse().ok());
        let gateway = entity.attribute("gateway_ip").and_then(|v| v.parse().ok());
        // Both must be present together; a partial answer counts as
        // not yet realized.
        if let (Some(cidr), Some(gateway)) = (cidr, gateway) {
            return Some(RealizedSubnet { cidr, gateway });
        }
    }
    None
}

/// Poll the realized-state endpoint until the pool subnet's CIDR and
/// gateway are both available.
///
/// Exhausting the budget yields `Ok(None)`: not an error, the caller
/// retries on the next reconcile. Only a failing read is an error.
pub async fn acquire_realized_subnet(
    client: &dyn PolicyClientTrait,
    intent_path: &str,
    retries: u32,
    delay: Duration,
) -> Result<Option<RealizedSubnet>, ControllerError> {
    let mut remaining = retries;
    loop {
        let entities = client.list_realized_entities(intent_path).await?;
        if let Some(realized) = realized_subnet_from(&entities) {
            return Ok(Some(realized));
        }
        if remaining == 0 {
            warn!(intent_path, "Pool subnet not realized after retries");
            return Ok(None);
        }
        remaining -= 1;
        info!(intent_path, remaining, "Pool subnet not yet realized, retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use policy_client::{MockPolicyClient, RealizedAttribute};

    #[test]
    fn next_vlan_returns_smallest_unused() {
        let used: HashSet<i64> = [1, 2, 3].into_iter().collect();
        assert_eq!(next_vlan(&used), Some(4));
    }

    #[test]
    fn next_vlan_skips_holes() {
        let used: HashSet<i64> = [1, 3].into_iter().collect();
        assert_eq!(next_vlan(&used), Some(2));
    }

    #[test]
    fn next_vlan_full_range_is_exhausted() {
        let used: HashSet<i64> = (VLAN_MIN..=VLAN_MAX).collect();
        assert_eq!(next_vlan(&used), None);
    }

    #[test]
    fn exhausted_set_insert_is_idempotent() {
        let blocks = ExhaustedBlocks::new();
        blocks.insert("/infra/ip-blocks/block-test");
        blocks.insert("/infra/ip-blocks/block-test");
        assert_eq!(blocks.len(), 1);
        blocks.remove("/infra/ip-blocks/missing");
        assert_eq!(blocks.len(), 1);
        blocks.remove("/infra/ip-blocks/block-test");
        assert!(blocks.is_empty());
    }

    #[test]
    fn capacity_error_path_is_extracted() {
        let error = MockPolicyClient::capacity_error("/infra/ip-blocks/block-test");
        assert_eq!(
            extract_exhausted_block(&error).as_deref(),
            Some("/infra/ip-blocks/block-test")
        );
    }

    #[test]
    fn related_capacity_error_path_is_extracted() {
        let error = MockPolicyClient::related_capacity_error("/infra/ip-blocks/block-test");
        assert_eq!(
            extract_exhausted_block(&error).as_deref(),
            Some("/infra/ip-blocks/block-test")
        );
    }

    #[test]
    fn other_errors_are_not_capacity_errors() {
        assert_eq!(
            extract_exhausted_block(&PolicyError::Api("boom".to_string())),
            None
        );
    }

    fn realized_entity(attrs: &[(&str, &str)]) -> RealizedEntity {
        RealizedEntity {
            entity_type: Some("IpBlockSubnet".to_string()),
            extended_attributes: attrs
                .iter()
                .map(|(key, value)| RealizedAttribute {
                    key: (*key).to_string(),
                    values: vec![(*value).to_string()],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn realization_succeeds_when_both_attributes_present() {
        let client = MockPolicyClient::new("http://mock");
        client.set_realized(
            "/infra/ip-pools/ipc_u1/ip-subnets/ibs_u1",
            vec![realized_entity(&[
                ("cidr", "10.0.4.0/24"),
                ("gateway_ip", "10.0.4.1"),
            ])],
        );
        let realized = acquire_realized_subnet(
            &client,
            "/infra/ip-pools/ipc_u1/ip-subnets/ibs_u1",
            0,
            Duration::ZERO,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(realized.gateway_cidr(), "10.0.4.1/24");
    }

    #[tokio::test]
    async fn realization_budget_exhaustion_is_neutral() {
        let client = MockPolicyClient::new("http://mock");
        // cidr alone is a partial answer, never a success
        client.set_realized(
            "/infra/ip-pools/ipc_u1/ip-subnets/ibs_u1",
            vec![realized_entity(&[("cidr", "10.0.4.0/24")])],
        );
        let realized = acquire_realized_subnet(
            &client,
            "/infra/ip-pools/ipc_u1/ip-subnets/ibs_u1",
            2,
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert!(realized.is_none());
    }
}
