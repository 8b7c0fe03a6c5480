//! Mock PolicyClient for unit testing
//!
//! This module provides a mock implementation of PolicyClientTrait that can be
//! used in unit tests without requiring a reachable policy API.

#![allow(clippy::unwrap_used)]

use crate::error::{ApiError, PolicyError, RelatedApiError};
use crate::models::*;
use crate::policy_trait::PolicyClientTrait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Error code the backend reports when an IP block has no free
/// addresses left for a carve.
pub const CAPACITY_ERROR_CODE: i64 = 520012;

/// Mock PolicyClient for testing
///
/// The mock serves seeded resources from memory, records every intent
/// patch it receives, and can be scripted to fail upcoming patches.
#[derive(Clone)]
pub struct MockPolicyClient {
    base_url: String,
    resources: Arc<Mutex<HashMap<ResourceKind, Vec<PolicyResource>>>>,
    resources_by_path: Arc<Mutex<HashMap<String, Value>>>,
    realized: Arc<Mutex<HashMap<String, Vec<RealizedEntity>>>>,
    infra_patches: Arc<Mutex<Vec<Infra>>>,
    org_root_patches: Arc<Mutex<Vec<OrgRoot>>>,
    patch_outcomes: Arc<Mutex<VecDeque<Option<PolicyError>>>>,
}

impl MockPolicyClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            resources: Arc::new(Mutex::new(HashMap::new())),
            resources_by_path: Arc::new(Mutex::new(HashMap::new())),
            realized: Arc::new(Mutex::new(HashMap::new())),
            infra_patches: Arc::new(Mutex::new(Vec::new())),
            org_root_patches: Arc::new(Mutex::new(Vec::new())),
            patch_outcomes: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Seed a resource into the searchable store (for test setup)
    pub fn add_resource(&self, resource: impl Into<PolicyResource>) {
        let resource = resource.into();
        self.resources
            .lock()
            .unwrap()
            .entry(resource.kind())
            .or_default()
            .push(resource);
    }

    /// Seed a raw resource for point reads at `path` (for test setup)
    pub fn add_resource_at_path(&self, path: impl Into<String>, value: Value) {
        self.resources_by_path
            .lock()
            .unwrap()
            .insert(path.into(), value);
    }

    /// Seed realized entities for an intent path (for test setup)
    pub fn set_realized(&self, intent_path: impl Into<String>, entities: Vec<RealizedEntity>) {
        self.realized
            .lock()
            .unwrap()
            .insert(intent_path.into(), entities);
    }

    /// Script the next unscripted intent patch to fail with `error`
    pub fn push_patch_failure(&self, error: PolicyError) {
        self.patch_outcomes.lock().unwrap().push_back(Some(error));
    }

    /// Script the next unscripted intent patch to succeed, so a later
    /// scripted failure can target the patch after it
    pub fn push_patch_success(&self) {
        self.patch_outcomes.lock().unwrap().push_back(None);
    }

    /// Every infra intent tree patched so far, in order
    pub fn infra_patches(&self) -> Vec<Infra> {
        self.infra_patches.lock().unwrap().clone()
    }

    /// Every org-root intent tree patched so far, in order
    pub fn org_root_patches(&self) -> Vec<OrgRoot> {
        self.org_root_patches.lock().unwrap().clone()
    }

    /// The structured capacity error the backend returns when the IP
    /// block at `block_path` is out of free addresses.
    pub fn capacity_error(block_path: &str) -> PolicyError {
        PolicyError::ApiDetail(ApiError {
            error_code: Some(CAPACITY_ERROR_CODE),
            error_message: Some(format!(
                "Insufficient free IP addresses in IpAddressBlock path=[{}]",
                block_path
            )),
            related_errors: Vec::new(),
        })
    }

    /// A structured capacity error reported through a related error
    /// rather than the top-level message.
    pub fn related_capacity_error(block_path: &str) -> PolicyError {
        PolicyError::ApiDetail(ApiError {
            error_code: Some(500060),
            error_message: Some("Child resource creation failed".to_string()),
            related_errors: vec![RelatedApiError {
                error_code: Some(CAPACITY_ERROR_CODE),
                error_message: Some(format!(
                    "Insufficient free IP addresses in IpAddressBlock path=[{}]",
                    block_path
                )),
            }],
        })
    }

    fn take_patch_failure(&self) -> Option<PolicyError> {
        self.patch_outcomes.lock().unwrap().pop_front().flatten()
    }
}

fn tags_match(resource_tags: &[Tag], criteria: &[Tag]) -> bool {
    criteria.iter().all(|wanted| {
        resource_tags.iter().any(|tag| {
            tag.scope == wanted.scope && (wanted.tag.is_empty() || tag.tag == wanted.tag)
        })
    })
}

#[async_trait::async_trait]
impl PolicyClientTrait for MockPolicyClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn validate_token(&self) -> Result<(), PolicyError> {
        Ok(())
    }

    async fn search_resources(
        &self,
        kind: ResourceKind,
        tags: &[Tag],
    ) -> Result<Vec<PolicyResource>, PolicyError> {
        let resources = self.resources.lock().unwrap();
        Ok(resources
            .get(&kind)
            .map(|list| {
                list.iter()
                    .filter(|r| tags_match(r.tags(), tags))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn patch_infra(&self, infra: &Infra) -> Result<(), PolicyError> {
        if let Some(error) = self.take_patch_failure() {
            return Err(error);
        }
        self.infra_patches.lock().unwrap().push(infra.clone());
        Ok(())
    }

    async fn patch_org_root(&self, org_root: &OrgRoot) -> Result<(), PolicyError> {
        if let Some(error) = self.take_patch_failure() {
            return Err(error);
        }
        self.org_root_patches.lock().unwrap().push(org_root.clone());
        Ok(())
    }

    async fn list_realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, PolicyError> {
        Ok(self
            .realized
            .lock()
            .unwrap()
            .get(intent_path)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_resource(&self, path: &str) -> Result<Option<Value>, PolicyError> {
        Ok(self.resources_by_path.lock().unwrap().get(path).cloned())
    }
}
