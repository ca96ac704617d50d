use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RejectedRecord;
use crate::fields::{FACILITY_KEYS, UNIT_KEYS};

/// One reading exactly as the tenant sent it: a JSON object for push sources,
/// a header-keyed row of strings for CSV sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// First present, non-null value among `keys`.
    pub fn first(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .find(|value| !value.is_null())
    }

    /// Text form of the first non-blank value among `keys`. Numbers are
    /// rendered with their JSON representation.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| match self.0.get(*key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn facility_code(&self) -> Option<String> {
        self.text(FACILITY_KEYS)
    }

    pub fn unit_code(&self) -> Option<String> {
        self.text(UNIT_KEYS)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// Outcome of parsing one tenant payload.
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    pub records: Vec<RawRecord>,
    pub rejected: Vec<RejectedRecord>,
}

impl ParsedBatch {
    /// Records seen, accepted or not.
    pub fn total(&self) -> usize {
        self.records.len() + self.rejected.len()
    }
}
