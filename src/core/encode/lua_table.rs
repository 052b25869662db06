//! Purpose: Keyed-table Lua encoding of tables.
//! Exports: `aggregate`, `row`, `map`, `manifest`, `render`.
//! Role: Rows are positional value lists; a generated `key` lookup plus a metatable
//!       lets callers index fields by name.
//! Invariants: Column positions in `key` follow the captured column order.
//! Invariants: Dict keys and map-shaped keys are emitted sorted.
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::core::table::{RowRecord, RowTable};
use crate::core::value::Value;

const FIELD_ACCESSOR: &str = "local meta = {
    __index = function(t, k)
        if key[k] == nil then
            return nil
        end
        return t[key[k]]
    end
}
";

const KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&name)
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                let _ = write!(out, "\\{:03}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Table-constructor field name: bare identifiers stay bare, anything else is bracketed.
fn field_name(name: &str) -> String {
    if is_identifier(name) {
        name.to_string()
    } else {
        format!("[{}]", quote(name))
    }
}

fn float(n: f64) -> String {
    if n.is_nan() {
        "0/0".to_string()
    } else if n == f64::INFINITY {
        "math.huge".to_string()
    } else if n == f64::NEG_INFINITY {
        "-math.huge".to_string()
    } else {
        n.to_string()
    }
}

/// Lua literal for one value.
pub fn render(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(n) => float(*n),
        Value::Str(s) => quote(s),
        Value::Bool(b) => b.to_string(),
        Value::List(items) => {
            let mut out = String::from("{");
            for item in items {
                out.push_str(&render(item));
                out.push_str(", ");
            }
            out.push('}');
            out
        }
        Value::Map(entries) => {
            let mut out = String::from("{");
            for (key, item) in entries {
                let _ = write!(out, "[{}] = {},", quote(key), render(item));
            }
            out.push('}');
            out
        }
    }
}

fn key_lookup(table: &RowTable) -> String {
    let mut out = String::from("local key = {");
    for (idx, column) in table.column_keys.iter().enumerate() {
        let _ = write!(out, "{}={}, ", field_name(column), idx + 1);
    }
    out.push_str("}\n");
    out
}

fn values(record: &RowRecord) -> String {
    render(&Value::List(record.values.clone()))
}

/// Whole table in one file: rows keyed by identity, then the field accessor.
pub fn aggregate(table: &RowTable) -> String {
    let mut out = key_lookup(table);
    out.push_str("local _M =\n{\n");
    for record in table.ordered_rows() {
        let _ = writeln!(out, "[{}]\t=\t{},", render(&record.values[0]), values(record));
    }
    out.push_str("}\n\n");
    out.push_str(FIELD_ACCESSOR);
    out.push_str("for _, v in pairs(_M) do\n    setmetatable(v, meta)\nend\n\nreturn _M");
    out
}

/// One row in its own file, carrying the same lookup and accessor.
pub fn row(table: &RowTable, record: &RowRecord) -> String {
    let mut out = key_lookup(table);
    out.push_str("local _M =\n");
    out.push_str(&values(record));
    out.push_str("\n\n");
    out.push_str(FIELD_ACCESSOR);
    out.push_str("setmetatable(_M, meta)\n\nreturn _M");
    out
}

pub fn map(map: &BTreeMap<String, Value>) -> String {
    let mut out = String::from("local _M =\n{\n");
    for (key, value) in map {
        let _ = writeln!(out, "{}\t=\t{},", field_name(key), render(value));
    }
    out.push_str("}\n\nreturn _M");
    out
}

pub fn manifest(ordered: &[&RowRecord]) -> String {
    let ids = ordered.iter().map(|record| record.values[0].clone()).collect();
    format!("return {}", render(&Value::List(ids)))
}
