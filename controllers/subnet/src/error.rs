//! Controller-specific error types.
//!
//! One enum covers the whole reconciliation taxonomy: validation
//! failures surface immediately, transient backend errors requeue,
//! and capacity/allocation exhaustion carry their own variants so
//! status conditions can name the reason.

use policy_client::PolicyError;
use thiserror::Error;

/// Errors that can occur in the subnet controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Policy API error (transient, requeued by the caller)
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Desired spec cannot be translated to backend resources
    #[error("validation error: {0}")]
    Validation(String),

    /// An IP block has no spare capacity for a new pool subnet
    #[error("ip block {block_path} is exhausted")]
    IpBlockExhausted {
        /// Path of the exhausted block
        block_path: String,
    },

    /// No VLAN tag left in [1, 4094] for the candidate parents
    #[error("vlan allocation exhausted: {0}")]
    AllocationExhausted(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether retrying in place can help. Capacity and allocation
    /// exhaustion need operator intervention; validation errors need a
    /// spec change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kube(_) | Self::Policy(_) | Self::Watch(_))
    }
}
