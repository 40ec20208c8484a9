//! Flattening of nested analysis records into single-level rows.
//!
//! Nested objects become dotted field paths (`{"a": {"b": 1}}` → `a.b`).
//! Arrays and scalars are kept as leaf values.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::source::json_type_name;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("expected a record or a list of records, got {0}")]
    NotRecords(&'static str),
    #[error("element {index} is {found}, not a record")]
    NotARecord { index: usize, found: &'static str },
}

/// A flattened record. Field order follows the source record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRow(Map<String, Value>);

impl NormalizedRow {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for NormalizedRow {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Flatten one record.
///
/// Nested objects become dotted paths, so a literal `"a.b"` key and
/// `{"a": {"b": ..}}` land in the same field; the later one wins.
pub fn flatten_record(record: &Map<String, Value>) -> NormalizedRow {
    let mut out = Map::new();
    flatten_into(None, record, &mut out);
    NormalizedRow(out)
}

fn flatten_into(prefix: Option<&str>, record: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (key, value) in record {
        let path = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten_into(Some(&path), inner, out),
            leaf => {
                if let Some(previous) = out.insert(path.clone(), leaf.clone()) {
                    log::debug!("Field '{path}' replaces earlier value {previous}");
                }
            }
        }
    }
}

/// Turn a category payload into rows: a list of records yields one row per
/// record, a single record yields exactly one row.
pub fn normalize_payload(payload: &Value) -> Result<Vec<NormalizedRow>, NormalizeError> {
    match payload {
        Value::Object(record) => Ok(vec![flatten_record(record)]),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(record) => Ok(flatten_record(record)),
                other => Err(NormalizeError::NotARecord {
                    index,
                    found: json_type_name(other),
                }),
            })
            .collect(),
        other => Err(NormalizeError::NotRecords(json_type_name(other))),
    }
}
