//! Declarative translation of mirrored columns into remote field names.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use super::Record;
use crate::flags::{DeletedFlags, VisibilityTarget};

/// How one column surfaces in the remote document.
#[derive(Debug, Clone, Copy)]
pub enum FieldRule {
    /// Omitted entirely when the column is NULL.
    Plain(&'static str, &'static str),
    /// Reported as `0` when the column is NULL.
    ZeroIfNull(&'static str, &'static str),
    /// Present as `true` only when the column is truthy.
    Flag(&'static str, &'static str),
    /// JSON stored as text, decoded in place. Omitted when NULL or malformed.
    Json(&'static str, &'static str),
}

/// A field rule gated on one value of the module's `prop` option.
/// An empty gate applies unconditionally.
pub type PropField = (&'static str, FieldRule);

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|number| number != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

pub fn apply(entry: &mut Map<String, Value>, record: &Record, rule: FieldRule) {
    match rule {
        FieldRule::Plain(column, field) => {
            if let Some(value) = record.get(column).filter(|value| !value.is_null()) {
                entry.insert(field.to_string(), value.clone());
            }
        }
        FieldRule::ZeroIfNull(column, field) => {
            let value = record
                .get(column)
                .filter(|value| !value.is_null())
                .cloned()
                .unwrap_or(Value::from(0));
            entry.insert(field.to_string(), value);
        }
        FieldRule::Flag(column, field) => {
            if record.get(column).is_some_and(truthy) {
                entry.insert(field.to_string(), Value::Bool(true));
            }
        }
        FieldRule::Json(column, field) => {
            if let Some(Value::String(text)) = record.get(column)
                && let Ok(decoded) = serde_json::from_str::<Value>(text)
            {
                entry.insert(field.to_string(), decoded);
            }
        }
    }
}

/// Applies every rule whose gate is empty or among the requested props.
pub fn map_record(record: &Record, table: &[PropField], props: &BTreeSet<String>) -> Map<String, Value> {
    let mut entry = Map::new();
    for (gate, rule) in table {
        if gate.is_empty() || props.contains(*gate) {
            apply(&mut entry, record, *rule);
        }
    }
    entry
}

/// Expands a visibility bitmask column into presence flags.
pub fn visibility(entry: &mut Map<String, Value>, record: &Record, column: &str, target: VisibilityTarget) {
    let bits = record.get(column).and_then(Value::as_i64).unwrap_or_default();
    for name in DeletedFlags::from_bits(bits).flag_names(target) {
        entry.insert(name.to_string(), Value::Bool(true));
    }
}

/// Marks anonymous authors the way the remote does.
pub fn anon_flag(entry: &mut Map<String, Value>) {
    if entry.get("userid").and_then(Value::as_i64) == Some(0) {
        entry.insert("anon".to_string(), Value::Bool(true));
    }
}

/// Sorted names from a `group_concat` column, empty when there are none.
pub fn joined_list(record: &Record, column: &str) -> Value {
    let mut tags = record
        .get(column)
        .and_then(Value::as_str)
        .map(|joined| {
            joined
                .split(super::TAG_SEPARATOR)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    tags.sort();
    Value::from(tags)
}
