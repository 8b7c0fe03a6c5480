//! Policy API client
//!
//! Implements the declarative policy REST API client: tag-scoped search,
//! hierarchical intent PATCH, and realized-state reads.

use crate::error::{ApiError, PolicyError};
use crate::models::*;
use crate::policy_trait::PolicyClientTrait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Policy API client
pub struct PolicyClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    result_count: Option<i64>,
}

#[derive(Deserialize)]
struct RealizedEntitiesResponse {
    #[serde(default)]
    results: Vec<RealizedEntity>,
}

impl PolicyClient {
    /// Create a new policy client
    ///
    /// # Arguments
    /// * `base_url` - API base URL (e.g., "https://policy-api:443")
    /// * `token` - Bearer token for authentication
    pub fn new(base_url: String, token: String) -> Result<Self, PolicyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(PolicyError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build the full-text search query for a kind plus tag criteria.
    ///
    /// A tag with an empty value contributes a scope-only clause, so it
    /// matches any value under that scope. Forward slashes in scopes
    /// must be escaped for the search grammar before URL encoding.
    fn search_query(kind: ResourceKind, tags: &[Tag]) -> String {
        let mut clauses = vec![format!("resource_type:{}", kind.as_str())];
        for tag in tags {
            clauses.push(format!("tags.scope:{}", tag.scope.replace('/', "\\/")));
            if !tag.tag.is_empty() {
                clauses.push(format!("tags.tag:{}", tag.tag.replace('/', "\\/")));
            }
        }
        clauses.join(" AND ")
    }

    /// Convert a non-success response into a typed error, preferring
    /// the structured API error body when it parses.
    async fn response_error(context: &str, response: reqwest::Response) -> PolicyError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
            if api_error.error_code.is_some() {
                return PolicyError::ApiDetail(api_error);
            }
        }
        PolicyError::Api(format!("{}: {} - {}", context, status, body))
    }
}

#[async_trait::async_trait]
impl PolicyClientTrait for PolicyClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Validate the token by reading the infra root.
    async fn validate_token(&self) -> Result<(), PolicyError> {
        let url = format!("{}/policy/api/v1/infra", self.base_url);
        debug!("Validating policy API token and connectivity");

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(PolicyError::Http)?;

        let status = response.status();
        if status == 401 || status == 403 {
            let body = response.text().await.unwrap_or_default();
            return Err(PolicyError::Api(format!(
                "Invalid token: {} - {}",
                status, body
            )));
        }
        if !status.is_success() {
            return Err(Self::response_error("Failed to validate token", response).await);
        }

        debug!("Token validated successfully");
        Ok(())
    }

    async fn search_resources(
        &self,
        kind: ResourceKind,
        tags: &[Tag],
    ) -> Result<Vec<PolicyResource>, PolicyError> {
        let query = Self::search_query(kind, tags);
        let mut cursor: Option<String> = None;
        let mut resources = Vec::new();

        loop {
            let mut url = format!(
                "{}/policy/api/v1/search/query?query={}",
                self.base_url,
                urlencoding::encode(&query)
            );
            if let Some(cursor) = &cursor {
                url = format!("{}&cursor={}", url, urlencoding::encode(cursor));
            }
            debug!(%kind, "Searching policy resources");

            let response = self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {}", self.token))
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(PolicyError::Http)?;

            if !response.status().is_success() {
                return Err(Self::response_error("Search failed", response).await);
            }

            let page: SearchResponse = response.json().await.map_err(PolicyError::Http)?;
            for result in page.results {
                resources.push(serde_json::from_value::<PolicyResource>(result)?);
            }

            match page.cursor {
                // An empty cursor on the last page also ends the walk.
                Some(next) if !next.is_empty() => {
                    if let Some(total) = page.result_count {
                        if resources.len() as i64 >= total {
                            break;
                        }
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        Ok(resources)
    }

    /// Apply an infra intent tree. Revision checks are disabled so the
    /// write is last-writer-wins against concurrent console edits.
    async fn patch_infra(&self, infra: &Infra) -> Result<(), PolicyError> {
        let url = format!(
            "{}/policy/api/v1/infra?enforce_revision_check=false",
            self.base_url
        );
        debug!(children = infra.children.len(), "Patching infra intent");

        let response = self
            .client
            .patch(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(infra)
            .send()
            .await
            .map_err(PolicyError::Http)?;

        if !response.status().is_success() {
            return Err(Self::response_error("Infra patch failed", response).await);
        }
        Ok(())
    }

    async fn patch_org_root(&self, org_root: &OrgRoot) -> Result<(), PolicyError> {
        let url = format!(
            "{}/policy/api/v1/orgs?enforce_revision_check=false",
            self.base_url
        );
        debug!(children = org_root.children.len(), "Patching org-root intent");

        let response = self
            .client
            .patch(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(org_root)
            .send()
            .await
            .map_err(PolicyError::Http)?;

        if !response.status().is_success() {
            return Err(Self::response_error("Org-root patch failed", response).await);
        }
        Ok(())
    }

    async fn list_realized_entities(
        &self,
        intent_path: &str,
    ) -> Result<Vec<RealizedEntity>, PolicyError> {
        let url = format!(
            "{}/policy/api/v1/infra/realized-state/realized-entities?intent_path={}",
            self.base_url,
            urlencoding::encode(intent_path)
        );
        debug!(intent_path, "Listing realized entities");

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(PolicyError::Http)?;

        if response.status() == 404 {
            return Err(PolicyError::NotFound(format!(
                "No realized state for {}",
                intent_path
            )));
        }
        if !response.status().is_success() {
            return Err(Self::response_error("Realized-state read failed", response).await);
        }

        let page: RealizedEntitiesResponse = response.json().await.map_err(PolicyError::Http)?;
        Ok(page.results)
    }

    async fn get_resource(&self, path: &str) -> Result<Option<Value>, PolicyError> {
        let url = format!("{}/policy/api/v1{}", self.base_url, path);
        debug!(path, "Fetching policy resource");

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(PolicyError::Http)?;

        if response.status() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::response_error("Resource read failed", response).await);
        }

        let value: Value = response.json().await.map_err(PolicyError::Http)?;
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_query_escapes_scope_slashes() {
        let query = PolicyClient::search_query(
            ResourceKind::Segment,
            &[
                Tag::new(TAG_SCOPE_CLUSTER, "cl1"),
                Tag::scope(TAG_SCOPE_CHILD_SUBNET_UID),
            ],
        );
        assert_eq!(
            query,
            "resource_type:Segment AND tags.scope:vnet-op\\/cluster AND tags.tag:cl1 \
             AND tags.scope:vnet-op\\/child_subnet_uid"
        );
    }
}
