//! SDN Policy API Client
//!
//! A Rust client library for the hierarchical, tag-addressed policy
//! API exposed by the SDN backend. Provides typed models for every
//! backend resource kind, a tag-scoped search, and atomic
//! hierarchical PATCH of the `Infra` and `OrgRoot` intent roots.
//!
//! # Example
//!
//! ```no_run
//! use policy_client::{PolicyClient, PolicyClientTrait, ResourceKind, Tag};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PolicyClient::new(
//!     "https://sdn-manager:443".to_string(),
//!     "your-api-token".to_string(),
//! )?;
//!
//! // Find every segment tagged with a cluster
//! let segments = client
//!     .search_resources(
//!         ResourceKind::Segment,
//!         &[Tag::scope(policy_client::TAG_SCOPE_CLUSTER)],
//!     )
//!     .await?;
//! # let _ = segments;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Tag search**: query any resource kind by tag scope/value pairs
//! - **Hierarchical writes**: one PATCH applies a whole intent tree
//!   atomically, with revision checking disabled
//! - **Realized state**: poll backend-computed values (CIDR, gateway)
//!   for asynchronously provisioned resources
//! - **Structured errors**: capacity-class API errors are surfaced
//!   with their error code and related errors intact

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod policy_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::PolicyClient;
pub use error::{ApiError, PolicyError, RelatedApiError};
pub use models::*;
pub use policy_trait::PolicyClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockPolicyClient;
