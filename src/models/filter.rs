//! Backend-neutral metadata filters used for deletes.

use std::fmt;

use super::message::{METADATA_RECORD_ID_FIELD, METADATA_RUN_ID_FIELD, METADATA_STREAM_FIELD};

/// How a metadata field is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    /// Field equals the value.
    Equals(String),
    /// Field equals any of the values.
    AnyOf(Vec<String>),
    /// Field differs from the value.
    Except(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCondition {
    pub key: String,
    pub matches: Match,
}

/// Conjunction of field conditions. Each backend translates it into its own
/// filter language.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    conditions: Vec<FieldCondition>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push(FieldCondition {
            key: key.into(),
            matches: Match::Equals(value.into()),
        });
        self
    }

    #[must_use]
    pub fn any_of(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.conditions.push(FieldCondition {
            key: key.into(),
            matches: Match::AnyOf(values),
        });
        self
    }

    #[must_use]
    pub fn except(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push(FieldCondition {
            key: key.into(),
            matches: Match::Except(value.into()),
        });
        self
    }

    /// Every record written for `stream`.
    pub fn stream(stream: &str) -> Self {
        Self::new().equals(METADATA_STREAM_FIELD, stream)
    }

    /// Records of `stream` with one of `record_ids` written by a run other than `run_id`.
    pub fn stale_records(stream: &str, record_ids: Vec<String>, run_id: &str) -> Self {
        Self::stream(stream)
            .any_of(METADATA_RECORD_ID_FIELD, record_ids)
            .except(METADATA_RUN_ID_FIELD, run_id)
    }

    pub fn conditions(&self) -> &[FieldCondition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl fmt::Display for MetadataFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .conditions
            .iter()
            .map(|c| match &c.matches {
                Match::Equals(v) => format!("{} == {:?}", c.key, v),
                Match::AnyOf(vs) => format!("{} in {:?}", c.key, vs),
                Match::Except(v) => format!("{} != {:?}", c.key, v),
            })
            .collect();
        write!(f, "{}", parts.join(" and "))
    }
}
