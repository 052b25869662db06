//! Purpose: Record (JSON) encoding of tables.
//! Exports: `aggregate`, `row`, `map`, `manifest`, `to_json`.
//! Notes: Tab-indented, object keys sorted; non-finite floats become `null`.
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Number, Value as JsonValue};

use crate::core::error::{Error, ErrorKind};
use crate::core::table::{RowRecord, RowTable};
use crate::core::value::Value;

pub fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Nil => JsonValue::Null,
        Value::Int(n) => JsonValue::Number((*n).into()),
        Value::Float(n) => Number::from_f64(*n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::List(items) => JsonValue::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => JsonValue::Object(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), to_json(item)))
                .collect(),
        ),
    }
}

fn row_object(table: &RowTable, record: &RowRecord) -> JsonValue {
    let fields: Map<String, JsonValue> = table
        .column_keys
        .iter()
        .zip(&record.values)
        .map(|(key, value)| (key.clone(), to_json(value)))
        .collect();
    JsonValue::Object(fields)
}

fn pretty(value: &JsonValue) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"\t"));
    value.serialize(&mut serializer).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode json")
            .with_source(err)
    })?;
    Ok(out)
}

/// One object keyed by row identity.
pub fn aggregate(table: &RowTable) -> Result<Vec<u8>, Error> {
    let rows: Map<String, JsonValue> = table
        .ordered_rows()
        .map(|record| (record.key.clone(), row_object(table, record)))
        .collect();
    pretty(&JsonValue::Object(rows))
}

pub fn row(table: &RowTable, record: &RowRecord) -> Result<Vec<u8>, Error> {
    pretty(&row_object(table, record))
}

pub fn map(map: &BTreeMap<String, Value>) -> Result<Vec<u8>, Error> {
    pretty(&to_json(&Value::Map(map.clone())))
}

pub fn manifest(ordered: &[&RowRecord]) -> Result<Vec<u8>, Error> {
    let ids = ordered
        .iter()
        .map(|record| to_json(&record.values[0]))
        .collect();
    pretty(&JsonValue::Array(ids))
}
