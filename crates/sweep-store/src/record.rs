//! Records, primary keys and continuation cursors.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::StoreError;

/// Partition key attribute shared by every table.
pub const PARTITION_KEY: &str = "PK";

/// Sort key attribute shared by every table.
pub const SORT_KEY: &str = "SK";

/// A stored item: a flat map of attribute names to JSON-like values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a record from a JSON object.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StoreError::InvalidRecord(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.0.get(attr)
    }

    pub fn get_str(&self, attr: &str) -> Option<&str> {
        self.0.get(attr).and_then(Value::as_str)
    }

    pub fn get_bool(&self, attr: &str) -> Option<bool> {
        self.0.get(attr).and_then(Value::as_bool)
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.0.contains_key(attr)
    }

    /// True when the attribute is absent or explicitly null.
    pub fn is_missing_or_null(&self, attr: &str) -> bool {
        matches!(self.0.get(attr), None | Some(Value::Null))
    }

    pub fn set(&mut self, attr: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(attr.into(), value.into());
    }

    /// Builder-style variant of [`Record::set`].
    pub fn with(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(attr, value);
        self
    }

    pub fn remove(&mut self, attr: &str) -> Option<Value> {
        self.0.remove(attr)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_attributes(self) -> Map<String, Value> {
        self.0
    }

    /// The record's primary key, if both key attributes are present strings.
    pub fn key(&self) -> Option<RecordKey> {
        Some(RecordKey {
            pk: self.get_str(PARTITION_KEY)?.to_string(),
            sk: self.get_str(SORT_KEY)?.to_string(),
        })
    }

    /// Like [`Record::key`], but a missing key is an error.
    pub fn require_key(&self) -> Result<RecordKey, StoreError> {
        self.key().ok_or_else(|| {
            StoreError::InvalidRecord(format!(
                "record is missing string {}/{} attributes",
                PARTITION_KEY, SORT_KEY
            ))
        })
    }

    /// Compare two records while ignoring the listed attributes.
    pub fn eq_ignoring(&self, other: &Record, ignored: &[&str]) -> bool {
        let relevant = |r: &Record| {
            r.0.iter()
                .filter(|(k, _)| !ignored.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>()
        };
        relevant(self) == relevant(other)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Primary key of a record (partition + sort).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub pk: String,
    pub sk: String,
}

impl RecordKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    /// A record holding only the key attributes.
    pub fn to_record(&self) -> Record {
        Record::new()
            .with(PARTITION_KEY, self.pk.clone())
            .with(SORT_KEY, self.sk.clone())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pk, self.sk)
    }
}

/// Opaque continuation token: the key attributes of the last evaluated item.
///
/// Only the store that produced a cursor knows how to interpret it. A page
/// without a cursor means the read is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Map<String, Value>);

impl Cursor {
    pub fn from_attributes(attributes: Map<String, Value>) -> Self {
        Self(attributes)
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get_str(&self, attr: &str) -> Option<&str> {
        self.0.get(attr).and_then(Value::as_str)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("<cursor>"),
        }
    }
}
