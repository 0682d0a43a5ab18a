//! Key conditions, filters and read requests.
//!
//! Conditions are plain data so that job descriptions can carry them as JSON.
//! [`MemoryStore`](crate::MemoryStore) evaluates them directly and the
//! DynamoDB backend renders them into expression strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{PARTITION_KEY, Record};

fn default_partition_attr() -> String {
    PARTITION_KEY.to_string()
}

/// Key condition for a query: partition equality plus an optional sort condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyCondition {
    /// Partition attribute of the table or index being queried.
    #[serde(default = "default_partition_attr")]
    pub partition_attr: String,
    /// Required partition value.
    pub partition: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortCondition>,
}

impl KeyCondition {
    /// Equality on the table's `PK` attribute.
    pub fn partition(value: impl Into<Value>) -> Self {
        Self {
            partition_attr: default_partition_attr(),
            partition: value.into(),
            sort: None,
        }
    }

    /// Equality on an arbitrary partition attribute (used for index queries).
    pub fn partition_on(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            partition_attr: attr.into(),
            partition: value.into(),
            sort: None,
        }
    }

    pub fn with_sort(mut self, sort: SortCondition) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        if record.get(&self.partition_attr) != Some(&self.partition) {
            return false;
        }
        match &self.sort {
            None => true,
            Some(sort) => sort.matches(record),
        }
    }
}

/// Condition on the sort attribute of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SortCondition {
    Eq { attr: String, value: Value },
    BeginsWith { attr: String, prefix: String },
}

impl SortCondition {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            SortCondition::Eq { attr, value } => record.get(attr) == Some(value),
            SortCondition::BeginsWith { attr, prefix } => record
                .get_str(attr)
                .is_some_and(|v| v.starts_with(prefix.as_str())),
        }
    }
}

/// Post-read filter.
///
/// Like the store's own filter expressions, filters run after the page limit
/// is applied, so a page may come back empty while the read continues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Attribute present and equal to `value`.
    Eq { attr: String, value: Value },
    /// Attribute absent or different from `value`.
    Ne { attr: String, value: Value },
    Exists { attr: String },
    NotExists { attr: String },
    /// Attribute absent or explicitly null.
    MissingOrNull { attr: String },
    /// Two attributes of the same record differ (absent counts as different from present).
    AttrNe { left: String, right: String },
    And { all: Vec<Filter> },
    Or { any: Vec<Filter> },
    Not { filter: Box<Filter> },
}

impl Filter {
    pub fn eq(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn ne(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn exists(attr: impl Into<String>) -> Self {
        Filter::Exists { attr: attr.into() }
    }

    pub fn not_exists(attr: impl Into<String>) -> Self {
        Filter::NotExists { attr: attr.into() }
    }

    pub fn missing_or_null(attr: impl Into<String>) -> Self {
        Filter::MissingOrNull { attr: attr.into() }
    }

    pub fn attr_ne(left: impl Into<String>, right: impl Into<String>) -> Self {
        Filter::AttrNe {
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn and(all: Vec<Filter>) -> Self {
        Filter::And { all }
    }

    pub fn or(any: Vec<Filter>) -> Self {
        Filter::Or { any }
    }

    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Eq { attr, value } => record.get(attr) == Some(value),
            Filter::Ne { attr, value } => record.get(attr) != Some(value),
            Filter::Exists { attr } => record.contains(attr),
            Filter::NotExists { attr } => !record.contains(attr),
            Filter::MissingOrNull { attr } => record.is_missing_or_null(attr),
            Filter::AttrNe { left, right } => record.get(left) != record.get(right),
            Filter::And { all } => all.iter().all(|f| f.matches(record)),
            Filter::Or { any } => any.iter().any(|f| f.matches(record)),
            Filter::Not { filter } => !filter.matches(record),
        }
    }
}

/// A single paginated read: a query when `key` is set, a full scan otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    /// Maximum items evaluated per page (before filtering).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl ReadRequest {
    pub fn scan(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            index: None,
            key: None,
            filter: None,
            limit: None,
        }
    }

    pub fn query(table: impl Into<String>, key: KeyCondition) -> Self {
        Self {
            key: Some(key),
            ..Self::scan(table)
        }
    }

    pub fn on_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    /// Add a filter, AND-ing it with any filter already present.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            None => filter,
            Some(Filter::And { mut all }) => {
                all.push(filter);
                Filter::And { all }
            }
            Some(existing) => Filter::and(vec![existing, filter]),
        });
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn is_scan(&self) -> bool {
        self.key.is_none()
    }
}
