//! Status conditions shared by both custom resources
//!
//! Mirrors the Kubernetes `metav1.Condition` shape. Transition times only
//! move when a condition's status actually flips.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Condition Types and Reasons
// =============================================================================

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_ERROR: &str = "Error";
pub const CONDITION_COMPONENTS_READY: &str = "ComponentsReady";
pub const CONDITION_DAEMONSET_READY: &str = "DaemonSetReady";

pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";
pub const REASON_ALL_COMPONENTS_READY: &str = "AllComponentsReady";
pub const REASON_SOME_COMPONENTS_NOT_READY: &str = "SomeComponentsNotReady";
pub const REASON_MISSING_CLUSTER_POLICY: &str = "MissingClusterPolicy";
pub const REASON_DAEMONSET_ALL_PODS_READY: &str = "DaemonSetAllPodsReady";
pub const REASON_DAEMONSET_PODS_NOT_READY: &str = "DaemonSetAllPodsNotReady";
/// Spelling matches what existing clusters already carry in their status.
pub const REASON_DAEMONSET_NOT_FOUND: &str = "DeamonSetNotFound";

// =============================================================================
// Condition
// =============================================================================

/// Tri-state condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single observation of an object's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition in CamelCase
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: String,
    /// Human-readable details
    #[serde(default)]
    pub message: String,
    /// Generation of the object this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        r#type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Set or merge `desired` into `conditions`.
///
/// The transition time is stamped with `now` when the condition is new or
/// its status changed; otherwise the existing timestamp is kept. Returns
/// whether anything in the list changed.
pub fn set_condition(conditions: &mut Vec<Condition>, desired: Condition, now: DateTime<Utc>) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.r#type == desired.r#type) else {
        let mut desired = desired;
        if desired.last_transition_time.is_none() {
            desired.last_transition_time = Some(now);
        }
        conditions.push(desired);
        return true;
    };

    let mut changed = false;
    if existing.status != desired.status {
        existing.status = desired.status;
        existing.last_transition_time = Some(desired.last_transition_time.unwrap_or(now));
        changed = true;
    }
    if existing.reason != desired.reason {
        existing.reason = desired.reason;
        changed = true;
    }
    if existing.message != desired.message {
        existing.message = desired.message;
        changed = true;
    }
    if existing.observed_generation != desired.observed_generation {
        existing.observed_generation = desired.observed_generation;
        changed = true;
    }
    changed
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}
