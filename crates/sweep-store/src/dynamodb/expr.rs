//! Attribute conversion and expression rendering for DynamoDB.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use serde_json::{Map, Number, Value};

use crate::StoreError;
use crate::condition::{Filter, KeyCondition, SortCondition};

pub(crate) fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), to_attribute(v)))
                .collect(),
        ),
    }
}

fn number(raw: &str) -> Result<Value, StoreError> {
    raw.parse::<Number>()
        .map(Value::Number)
        .map_err(|e| StoreError::InvalidRecord(format!("bad number {:?}: {}", raw, e)))
}

pub(crate) fn from_attribute(attr: &AttributeValue) -> Result<Value, StoreError> {
    Ok(match attr {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => number(n)?,
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(items) => Value::Array(
            items
                .iter()
                .map(from_attribute)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        AttributeValue::M(map) => Value::Object(from_item(map)?),
        AttributeValue::Ss(items) => Value::Array(items.iter().cloned().map(Value::String).collect()),
        AttributeValue::Ns(items) => Value::Array(
            items
                .iter()
                .map(|n| number(n))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        other => {
            return Err(StoreError::InvalidRecord(format!(
                "unsupported attribute type: {:?}",
                other
            )));
        }
    })
}

pub(crate) fn from_item(
    item: &HashMap<String, AttributeValue>,
) -> Result<Map<String, Value>, StoreError> {
    item.iter()
        .map(|(k, v)| Ok((k.clone(), from_attribute(v)?)))
        .collect()
}

pub(crate) fn to_item(map: &Map<String, Value>) -> HashMap<String, AttributeValue> {
    map.iter()
        .map(|(k, v)| (k.clone(), to_attribute(v)))
        .collect()
}

/// Collects `#nN` / `:vN` placeholders while rendering expressions.
#[derive(Debug, Default)]
pub(crate) struct ExpressionBuilder {
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
    placeholders: HashMap<String, String>,
}

impl ExpressionBuilder {
    fn name(&mut self, attr: &str) -> String {
        if let Some(existing) = self.placeholders.get(attr) {
            return existing.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), attr.to_string());
        self.placeholders
            .insert(attr.to_string(), placeholder.clone());
        placeholder
    }

    fn value(&mut self, value: AttributeValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), value);
        placeholder
    }

    pub(crate) fn key_condition(&mut self, key: &KeyCondition) -> String {
        let pk = self.name(&key.partition_attr);
        let pv = self.value(to_attribute(&key.partition));
        let mut expr = format!("{} = {}", pk, pv);
        match &key.sort {
            None => {}
            Some(SortCondition::Eq { attr, value }) => {
                let n = self.name(attr);
                let v = self.value(to_attribute(value));
                expr.push_str(&format!(" AND {} = {}", n, v));
            }
            Some(SortCondition::BeginsWith { attr, prefix }) => {
                let n = self.name(attr);
                let v = self.value(AttributeValue::S(prefix.clone()));
                expr.push_str(&format!(" AND begins_with({}, {})", n, v));
            }
        }
        expr
    }

    pub(crate) fn filter(&mut self, filter: &Filter) -> Result<String, StoreError> {
        Ok(match filter {
            Filter::Eq { attr, value } => {
                let n = self.name(attr);
                format!("{} = {}", n, self.value(to_attribute(value)))
            }
            Filter::Ne { attr, value } => {
                let n = self.name(attr);
                format!("{} <> {}", n, self.value(to_attribute(value)))
            }
            Filter::Exists { attr } => format!("attribute_exists({})", self.name(attr)),
            Filter::NotExists { attr } => format!("attribute_not_exists({})", self.name(attr)),
            Filter::MissingOrNull { attr } => {
                let n = self.name(attr);
                let t = self.value(AttributeValue::S("NULL".into()));
                format!("(attribute_not_exists({}) OR attribute_type({}, {}))", n, n, t)
            }
            Filter::AttrNe { left, right } => {
                let l = self.name(left);
                format!("{} <> {}", l, self.name(right))
            }
            Filter::And { all } => self.join(all, " AND ")?,
            Filter::Or { any } => self.join(any, " OR ")?,
            Filter::Not { filter } => format!("(NOT {})", self.filter(filter)?),
        })
    }

    fn join(&mut self, filters: &[Filter], op: &str) -> Result<String, StoreError> {
        if filters.is_empty() {
            return Err(StoreError::InvalidRequest(
                "empty and/or filter cannot be rendered".into(),
            ));
        }
        let parts = filters
            .iter()
            .map(|f| self.filter(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", parts.join(op)))
    }

    /// Names and values maps, `None` when empty (the API rejects empty maps).
    pub(crate) fn into_parts(
        self,
    ) -> (
        Option<HashMap<String, String>>,
        Option<HashMap<String, AttributeValue>>,
    ) {
        let names = (!self.names.is_empty()).then_some(self.names);
        let values = (!self.values.is_empty()).then_some(self.values);
        (names, values)
    }
}
