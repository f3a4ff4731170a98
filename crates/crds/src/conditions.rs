//! Status conditions shared by PhysicalHost and MetalMachine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type stamped on every guarded lifecycle transition.
pub const CONDITION_STATE_TRANSITION: &str = "StateTransition";

/// Condition type recorded when a stuck host is recovered.
pub const CONDITION_STUCK_RECOVERY: &str = "StuckStateRecovery";

/// Condition type on MetalMachine describing the host claim.
pub const CONDITION_HOST_CLAIMED: &str = "HostClaimed";

/// Condition type on MetalMachine describing provisioning.
pub const CONDITION_HOST_PROVISIONED: &str = "HostProvisioned";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    /// Machine-readable reason, PascalCase
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl HostCondition {
    /// Creates a condition stamped with the current time.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Inserts or replaces the condition with the same type.
///
/// Every call moves `lastTransitionTime`; the lifecycle clock used for stuck
/// detection depends on that.
pub fn set_condition(conditions: &mut Vec<HostCondition>, condition: HostCondition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Looks up a condition by type.
pub fn find_condition<'a>(conditions: &'a [HostCondition], type_: &str) -> Option<&'a HostCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Most recent `lastTransitionTime` across all conditions.
pub fn latest_transition(conditions: &[HostCondition]) -> Option<DateTime<Utc>> {
    conditions.iter().map(|c| c.last_transition_time).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_condition_replaces_same_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, HostCondition::new("A", ConditionStatus::False, "First", ""));
        set_condition(&mut conditions, HostCondition::new("B", ConditionStatus::True, "Other", ""));
        set_condition(&mut conditions, HostCondition::new("A", ConditionStatus::True, "Second", "msg"));

        assert_eq!(conditions.len(), 2);
        let a = find_condition(&conditions, "A").unwrap();
        assert_eq!(a.reason, "Second");
        assert_eq!(a.status, ConditionStatus::True);
    }

    #[test]
    fn test_latest_transition_picks_max() {
        let mut old = HostCondition::new("A", ConditionStatus::True, "Old", "");
        old.last_transition_time = Utc::now() - Duration::minutes(10);
        let new = HostCondition::new("B", ConditionStatus::True, "New", "");
        let expected = new.last_transition_time;

        assert_eq!(latest_transition(&[old, new]), Some(expected));
        assert_eq!(latest_transition(&[]), None);
    }
}
