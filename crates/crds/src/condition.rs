//! Status conditions shared by the vnetops CRDs
//!
//! Conditions carry a machine-readable reason drawn from a fixed
//! catalog so operators can alert on the reason field rather than
//! parsing free-text messages.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single status condition on a vnetops resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (currently only "Ready")
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// "True", "False" or "Unknown"
    pub status: String,

    /// Machine-readable reason from the fixed catalog
    pub reason: ConditionReason,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the condition transitioned between states
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Condition types reported by the subnet controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// The resource has been fully realized on the backend.
    Ready,
}

/// The fixed catalog of condition reasons.
///
/// Every user-visible failure maps onto exactly one of these; new
/// failure modes require a new variant, not a new free-text string.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionReason {
    /// All backend resources exist and are realized.
    Ready,
    /// A dependency (parent configuration, routing tier) is not
    /// available yet; retry on a later reconcile.
    DependencyNotReady,
    /// The backing IP block has no spare capacity.
    CapacityExhausted,
    /// No VLAN tag is available on any candidate parent segment;
    /// operator intervention is required.
    AllocationExhausted,
    /// The backend rejected or failed the request.
    BackendError,
}

impl Condition {
    /// Build a Ready=True condition.
    pub fn ready() -> Self {
        Self {
            type_: ConditionType::Ready,
            status: "True".to_string(),
            reason: ConditionReason::Ready,
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// Build a Ready=False condition with the given reason and message.
    pub fn not_ready(reason: ConditionReason, message: impl Into<String>) -> Self {
        Self {
            type_: ConditionType::Ready,
            status: "False".to_string(),
            reason,
            message: Some(message.into()),
            last_transition_time: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_serializes_to_catalog_string() {
        let value = serde_json::to_value(ConditionReason::AllocationExhausted).unwrap();
        assert_eq!(value, serde_json::json!("AllocationExhausted"));
    }

    #[test]
    fn not_ready_carries_reason_and_message() {
        let cond = Condition::not_ready(ConditionReason::DependencyNotReady, "no parent config");
        assert_eq!(cond.status, "False");
        assert_eq!(cond.reason, ConditionReason::DependencyNotReady);
        assert_eq!(cond.message.as_deref(), Some("no parent config"));
    }
}
