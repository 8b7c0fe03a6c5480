//! Policy API client errors

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when interacting with the policy API
#[derive(Debug, Error)]
pub enum PolicyError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The policy API returned an unstructured error
    #[error("policy API error: {0}")]
    Api(String),

    /// The policy API returned a structured error body
    #[error("policy API error: {0}")]
    ApiDetail(ApiError),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g. an unparseable intent path)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A listing returned a resource of a kind the caller did not ask
    /// for. This is a programmer error, never retried.
    #[error("unexpected resource kind: expected {expected}, got {got}")]
    UnexpectedKind {
        /// Kind the caller asked for
        expected: &'static str,
        /// Kind actually decoded from the wire
        got: &'static str,
    },
}

/// Structured error body returned by the policy API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    /// Backend error code (e.g. 520012 for IP block capacity
    /// exhaustion)
    pub error_code: Option<i64>,
    /// Human-readable message
    pub error_message: Option<String>,
    /// Errors for individual resources inside a hierarchical write
    #[serde(default)]
    pub related_errors: Vec<RelatedApiError>,
}

/// One entry of [`ApiError::related_errors`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelatedApiError {
    /// Backend error code for this resource
    pub error_code: Option<i64>,
    /// Human-readable message for this resource
    pub error_message: Option<String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.error_code, self.error_message.as_deref()) {
            (Some(code), Some(msg)) => write!(f, "{code}: {msg}"),
            (Some(code), None) => write!(f, "{code}"),
            (None, Some(msg)) => write!(f, "{msg}"),
            (None, None) => write!(f, "unknown error"),
        }
    }
}
