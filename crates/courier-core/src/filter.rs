//! Endpoint filter predicates evaluated against event payloads.
//!
//! An endpoint may narrow the events it receives with a map of conditions
//! keyed by top-level payload field:
//!
//! ```json
//! { "status": { "operator": "equals", "value": "critical" } }
//! ```
//!
//! A condition whose field is absent from the payload is ignored. Every
//! remaining condition must hold for the endpoint to qualify.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison applied by a single filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// Payload value equals the condition value.
    #[default]
    Equals,
    /// Payload value differs from the condition value.
    NotEquals,
    /// Substring for strings, membership for arrays, key presence for
    /// objects.
    Contains,
}

/// One `{operator, value}` condition attached to a payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Comparison to apply; defaults to `equals`.
    #[serde(default)]
    pub operator: FilterOperator,
    /// Value the payload field is compared against.
    pub value: Value,
}

impl FilterCondition {
    /// Creates an `equals` condition.
    pub fn equals(value: impl Into<Value>) -> Self {
        Self { operator: FilterOperator::Equals, value: value.into() }
    }

    /// Creates a `not_equals` condition.
    pub fn not_equals(value: impl Into<Value>) -> Self {
        Self { operator: FilterOperator::NotEquals, value: value.into() }
    }

    /// Creates a `contains` condition.
    pub fn contains(value: impl Into<Value>) -> Self {
        Self { operator: FilterOperator::Contains, value: value.into() }
    }

    /// Evaluates this condition against a present payload value.
    pub fn holds_for(&self, actual: &Value) -> bool {
        match self.operator {
            FilterOperator::Equals => values_equal(actual, &self.value),
            FilterOperator::NotEquals => !values_equal(actual, &self.value),
            FilterOperator::Contains => value_contains(actual, &self.value),
        }
    }
}

/// Field name to condition map stored on an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterConditions(pub BTreeMap<String, FilterCondition>);

impl FilterConditions {
    /// Creates an empty filter that accepts every payload.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a condition for `field`, replacing any existing one.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, condition: FilterCondition) -> Self {
        self.0.insert(field.into(), condition);
        self
    }

    /// Returns true when no conditions are configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true when the payload satisfies every applicable condition.
    ///
    /// Non-object payloads have no fields, so every condition is skipped.
    pub fn matches(&self, payload: &Value) -> bool {
        let Some(fields) = payload.as_object() else {
            return true;
        };

        self.0.iter().all(|(field, condition)| match fields.get(field) {
            Some(actual) => condition.holds_for(actual),
            None => true,
        })
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        // 10 and 10.0 compare equal
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => actual == expected,
    }
}

fn value_contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let filter = FilterConditions::new();
        assert!(filter.matches(&json!({"anything": 1})));
        assert!(filter.matches(&json!(null)));
    }

    #[test]
    fn equals_requires_matching_value() {
        let filter = FilterConditions::new().with("status", FilterCondition::equals("critical"));

        assert!(filter.matches(&json!({"status": "critical"})));
        assert!(!filter.matches(&json!({"status": "minor"})));
    }

    #[test]
    fn absent_field_is_ignored() {
        let filter = FilterConditions::new().with("status", FilterCondition::equals("critical"));
        assert!(filter.matches(&json!({"other": "value"})));
    }

    #[test]
    fn not_equals_negates() {
        let filter = FilterConditions::new().with("region", FilterCondition::not_equals("eu"));

        assert!(filter.matches(&json!({"region": "us"})));
        assert!(!filter.matches(&json!({"region": "eu"})));
    }

    #[test]
    fn contains_handles_strings_arrays_and_objects() {
        let filter = FilterConditions::new().with("tags", FilterCondition::contains("vip"));

        assert!(filter.matches(&json!({"tags": ["new", "vip"]})));
        assert!(!filter.matches(&json!({"tags": ["new"]})));
        assert!(filter.matches(&json!({"tags": "vip-customer"})));
        assert!(filter.matches(&json!({"tags": {"vip": true}})));
        assert!(!filter.matches(&json!({"tags": 42})));
    }

    #[test]
    fn numbers_compare_by_value() {
        let filter = FilterConditions::new().with("quantity", FilterCondition::equals(10));

        assert!(filter.matches(&json!({"quantity": 10.0})));
        assert!(!filter.matches(&json!({"quantity": 2})));
        assert!(!filter.matches(&json!({"quantity": "10"})));
    }

    #[test]
    fn all_present_conditions_must_hold() {
        let filter = FilterConditions::new()
            .with("status", FilterCondition::equals("critical"))
            .with("region", FilterCondition::not_equals("eu"));

        assert!(filter.matches(&json!({"status": "critical", "region": "us"})));
        assert!(!filter.matches(&json!({"status": "critical", "region": "eu"})));
        assert!(filter.matches(&json!({"status": "critical"})));
    }

    #[test]
    fn deserializes_stored_format() {
        let filter: FilterConditions = serde_json::from_value(json!({
            "quantity": {"operator": "equals", "value": 10},
            "sku": {"value": "X1"}
        }))
        .unwrap();

        assert_eq!(filter.0["quantity"], FilterCondition::equals(10));
        assert_eq!(filter.0["sku"].operator, FilterOperator::Equals);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let result: Result<FilterConditions, _> =
            serde_json::from_value(json!({"status": {"operator": "matches", "value": "x"}}));
        assert!(result.is_err());
    }
}
