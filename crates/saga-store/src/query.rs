use serde_json::{Map, Value};

use crate::SagaRecord;

/// Filter over stored saga instances.
///
/// All predicates must hold. Field predicates compare top-level fields of
/// the instance's JSON data for equality, which lets a message find its saga
/// by a business key instead of the correlation id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SagaQuery {
    /// Only instances in this state.
    pub state: Option<String>,

    /// Top-level data fields that must equal the given values.
    pub fields: Map<String, Value>,

    /// Maximum number of instances to return.
    pub limit: Option<usize>,
}

impl SagaQuery {
    /// Creates a new empty query matching every instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query matching instances whose `field` equals `value`.
    pub fn field_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().and_field(field, value)
    }

    /// Adds a field equality predicate.
    pub fn and_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Restricts the query to instances in `state`.
    pub fn in_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Limits the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the record satisfies every predicate.
    pub fn matches(&self, record: &SagaRecord) -> bool {
        if let Some(ref state) = self.state
            && &record.current_state != state
        {
            return false;
        }
        self.fields
            .iter()
            .all(|(name, expected)| record.field(name) == Some(expected))
    }

    /// Returns the field predicates as a single JSON object, suitable for a
    /// containment check.
    pub fn fields_as_object(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CorrelationId, Version};

    fn record(state: &str, data: Value) -> SagaRecord {
        SagaRecord::new(CorrelationId::new(), state, Version::first(), data)
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(SagaQuery::new().matches(&record("Active", serde_json::json!({}))));
    }

    #[test]
    fn field_predicates_must_all_hold() {
        let r = record("Active", serde_json::json!({"key": "Unique", "region": "eu"}));

        assert!(SagaQuery::field_eq("key", "Unique").matches(&r));
        assert!(
            SagaQuery::field_eq("key", "Unique")
                .and_field("region", "eu")
                .matches(&r)
        );
        assert!(
            !SagaQuery::field_eq("key", "Unique")
                .and_field("region", "us")
                .matches(&r)
        );
        assert!(!SagaQuery::field_eq("missing", 1).matches(&r));
    }

    #[test]
    fn state_predicate() {
        let r = record("Active", serde_json::json!({}));
        assert!(SagaQuery::new().in_state("Active").matches(&r));
        assert!(!SagaQuery::new().in_state("Done").matches(&r));
    }

    #[test]
    fn fields_as_object_builds_containment_document() {
        let q = SagaQuery::field_eq("key", "Unique").and_field("n", 3);
        assert_eq!(
            q.fields_as_object(),
            serde_json::json!({"key": "Unique", "n": 3})
        );
    }
}
