use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CorrelationId;

/// Version number of a persisted saga instance, used for optimistic concurrency control.
///
/// A never-persisted instance is at version 0. The first insert writes
/// version 1 and every later write increments it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for an instance that has not been stored yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version (1) written by the first insert.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// A saga instance as it is stored: identity, state marker, version and the
/// instance's business fields as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The instance's correlation id (primary key).
    pub correlation_id: CorrelationId,

    /// Name of the state the instance is currently in.
    pub current_state: String,

    /// Version of the stored row.
    pub version: Version,

    /// Serialized instance.
    pub data: serde_json::Value,

    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Creates a record at the given version.
    pub fn new(
        correlation_id: CorrelationId,
        current_state: impl Into<String>,
        version: Version,
        data: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id,
            current_state: current_state.into(),
            version,
            data,
            updated_at: Utc::now(),
        }
    }

    /// Returns a copy of this record carrying the next version and new contents.
    pub fn next_revision(&self, current_state: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(
            self.correlation_id,
            current_state,
            self.version.next(),
            data,
        )
    }

    /// Reads a top-level field of the stored data.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn next_revision_keeps_identity_and_bumps_version() {
        let id = CorrelationId::new();
        let record = SagaRecord::new(id, "Initial", Version::first(), serde_json::json!({}));
        let next = record.next_revision("Active", serde_json::json!({"key": "Unique"}));

        assert_eq!(next.correlation_id, id);
        assert_eq!(next.version, Version::new(2));
        assert_eq!(next.current_state, "Active");
        assert_eq!(next.field("key"), Some(&serde_json::json!("Unique")));
    }
}
