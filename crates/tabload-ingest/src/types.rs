//! Record types flowing through the pipeline

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::schema::PartitionSchema;

/// One raw input row keyed by (already filtered) header name
///
/// Header names are shared between all rows of a source; `None` marks a
/// column that was missing from a short row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    headers: Arc<[String]>,
    values: Vec<Option<String>>,
}

impl SourceRecord {
    pub fn new(headers: Arc<[String]>, values: Vec<Option<String>>) -> Self {
        Self { headers, values }
    }

    /// Convenience constructor, mostly for tests
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let (headers, values): (Vec<String>, Vec<Option<String>>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), Some(v.into())))
            .unzip();
        Self {
            headers: headers.into(),
            values,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .position(|h| h == name)
            .and_then(|i| self.values.get(i))
            .and_then(|v| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), self.values.get(i).and_then(|v| v.as_deref())))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// A typed field value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

/// A typed row restricted to schema fields; empty values are never stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct NormalizedRecord {
    values: BTreeMap<String, Value>,
}

impl NormalizedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Natural-key values in key order, or `None` if any is absent
    pub fn natural_key(&self, schema: &PartitionSchema) -> Option<Vec<Value>> {
        schema
            .natural_key()
            .iter()
            .map(|k| self.values.get(k).cloned())
            .collect()
    }
}

/// An ordered run of normalized records handed to the writer pool as a unit
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    seq: u64,
    records: Vec<NormalizedRecord>,
}

impl Batch {
    pub fn new(seq: u64, records: Vec<NormalizedRecord>) -> Self {
        Self { seq, records }
    }

    /// Position of this batch within its source, starting at 0
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
