//! PolicyClient trait for mocking
//!
//! This trait abstracts the PolicyClient to enable mocking in unit tests.
//! The concrete PolicyClient implements this trait, and tests can use mock implementations.

use crate::error::PolicyError;
use crate::models::*;
use serde_json::Value;

/// Trait for policy API client operations
///
/// This trait enables mocking of policy API calls for unit testing.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait PolicyClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Validate the API token
    async fn validate_token(&self) -> Result<(), PolicyError>;

    // Search
    /// List every resource of `kind` annotated with all of `tags`.
    /// A tag with an empty value matches any value under its scope.
    /// Follows the result cursor until the listing is exhausted.
    async fn search_resources(
        &self,
        kind: ResourceKind,
        tags: &[Tag],
    ) -> Result<Vec<PolicyResource>, PolicyError>;

    // Hierarchical writes
    /// Apply an infra intent tree in one atomic PATCH.
    async fn patch_infra(&self, infra: &Infra) -> Result<(), PolicyError>;
    /// Apply an org-root intent tree in one atomic PATCH.
    async fn patch_org_root(&self, org_root: &OrgRoot) -> Result<(), PolicyError>;

    // Realized state
    /// List realized entities for the resource at `intent_path`.
    async fn list_realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, PolicyError>;

    // Point reads
    /// Fetch the raw resource at `path`, `None` when it does not exist.
    async fn get_resource(&self, path: &str) -> Result<Option<Value>, PolicyError>;
}
