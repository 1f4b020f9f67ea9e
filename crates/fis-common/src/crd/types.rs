//! Shared types used by both CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting whether the resource is converged
pub const CONDITION_READY: &str = "Ready";

/// Condition type marking a terminal failure that only a spec change clears
pub const CONDITION_STALLED: &str = "Stalled";

/// Key/value tag propagated to AWS resources
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Tag {
    /// Tag key
    pub key: String,
    /// Tag value
    pub value: String,
}

impl Tag {
    /// Create a tag
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Ready, Stalled)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Generation the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
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
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Record the generation this condition describes
    pub fn with_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}

/// Insert or replace a condition by type.
///
/// The transition time is only moved when the status actually flips, so
/// re-asserting an unchanged condition leaves the status byte-for-byte equal.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_condition_appends_new_type() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::True, "Created", "ok"),
        );
        set_condition(
            &mut conditions,
            Condition::new(CONDITION_STALLED, ConditionStatus::False, "Progressing", ""),
        );
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let earlier = Utc::now() - Duration::hours(1);
        let mut first = Condition::new(CONDITION_READY, ConditionStatus::True, "Created", "a");
        first.last_transition_time = earlier;
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::True, "Updated", "b"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, earlier);
        assert_eq!(conditions[0].reason, "Updated");
    }

    #[test]
    fn test_set_condition_moves_transition_time_on_flip() {
        let earlier = Utc::now() - Duration::hours(1);
        let mut first = Condition::new(CONDITION_READY, ConditionStatus::True, "Created", "a");
        first.last_transition_time = earlier;
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            Condition::new(CONDITION_READY, ConditionStatus::False, "Failed", "b"),
        );

        assert!(conditions[0].last_transition_time > earlier);
    }

    #[test]
    fn test_condition_serializes_with_kubernetes_field_names() {
        let condition = Condition::new(CONDITION_READY, ConditionStatus::True, "Created", "ok")
            .with_generation(3);
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert_eq!(json["observedGeneration"], 3);
        assert!(json.get("lastTransitionTime").is_some());
    }
}
