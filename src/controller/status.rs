//! Status management utilities.
//!
//! Provides helpers for building and updating resource status conditions.

use crate::crd::{Condition, ConditionType};

/// Builder for managing conditions list
///
/// Starts from the conditions currently on the resource so that a condition
/// whose status did not change keeps its `lastTransitionTime`.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from existing conditions
    pub fn from_existing(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        // Find and replace existing condition of same type
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set Validated condition
    pub fn validated(
        &mut self,
        valid: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::validated(valid, reason, message, generation))
    }

    /// Set PartitionHealing condition
    pub fn partition_healing(
        &mut self,
        healing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::partition_healing(
            healing, reason, message, generation,
        ))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    let condition_type = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

/// Check if a condition is present and explicitly false
pub fn is_condition_false(conditions: &[Condition], condition_type: ConditionType) -> bool {
    let condition_type = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "False")
}

/// Get the reason for a condition
pub fn get_condition_reason(
    conditions: &[Condition],
    condition_type: ConditionType,
) -> Option<&str> {
    let condition_type = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .map(|c| c.reason.as_str())
}
