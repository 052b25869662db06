//! Purpose: Convert one cell's text into a typed `Value` under its `TypeDecl`.
//! Exports: `CellContext`, `parse_value`, `bracket_groups`.
//! Role: Recursive value parser shared by row tables, map tables, and Func pieces.
//! Invariants: A bound hook fully overrides built-in parsing and default substitution.
//! Invariants: Conversion failures are fatal and carry table/row/column context.
//! Notes: Surrounding whitespace is trimmed; inner whitespace is preserved for `Str`.
use std::collections::BTreeMap;

use crate::core::error::{Error, ErrorKind};
use crate::core::func;
use crate::core::grammar::{TypeDecl, TypeDescriptor, parse_bool};
use crate::core::value::Value;
use crate::hook::{HookRef, ScriptEngine};

/// Where a cell lives, for diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct CellContext<'a> {
    pub table: &'a str,
    /// 1-based sheet row.
    pub row: usize,
    pub column: &'a str,
}

pub fn parse_value(
    text: &str,
    decl: &TypeDecl,
    hook: Option<&HookRef>,
    engine: &mut dyn ScriptEngine,
    ctx: CellContext<'_>,
) -> Result<Value, Error> {
    let text = text.trim();
    let result = match hook {
        Some(hook) => engine.call_hook(hook, text),
        None => parse_by_decl(text, decl, engine),
    };
    result.map_err(|err| err.or_context(ctx.table, Some(ctx.row), Some(ctx.column)))
}

fn parse_by_decl(text: &str, decl: &TypeDecl, engine: &mut dyn ScriptEngine) -> Result<Value, Error> {
    match &decl.ty {
        TypeDescriptor::Nil => Ok(Value::Nil),
        TypeDescriptor::Int => {
            if text.is_empty() {
                return Ok(default_or(decl, Value::Int(0)));
            }
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| conversion_error(text, &decl.ty))
        }
        TypeDescriptor::Float => {
            if text.is_empty() {
                return Ok(default_or(decl, Value::Float(0.0)));
            }
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| conversion_error(text, &decl.ty))
        }
        TypeDescriptor::Str => {
            if text.is_empty() {
                return Ok(default_or(decl, Value::Str(String::new())));
            }
            Ok(Value::Str(text.to_string()))
        }
        TypeDescriptor::Bool => {
            if text.is_empty() {
                return Ok(default_or(decl, Value::Bool(false)));
            }
            parse_bool(text)
                .map(Value::Bool)
                .ok_or_else(|| conversion_error(text, &decl.ty))
        }
        TypeDescriptor::List(elem) => parse_list(text, elem, engine),
        TypeDescriptor::Dict(fields) => parse_dict(text, fields, engine),
        TypeDescriptor::Enum(members) => {
            if text.is_empty() {
                return Ok(default_or(decl, Value::Int(0)));
            }
            members
                .iter()
                .find(|(name, _)| name == text)
                .map(|(_, code)| Value::Int(*code))
                .ok_or_else(|| conversion_error(text, &decl.ty))
        }
        TypeDescriptor::Func(tag) => func::parse_func(text, tag, decl.default.as_ref(), engine),
    }
}

fn default_or(decl: &TypeDecl, zero: Value) -> Value {
    decl.default.clone().map(Value::from).unwrap_or(zero)
}

fn conversion_error(text: &str, ty: &TypeDescriptor) -> Error {
    Error::new(ErrorKind::Conversion).with_message(format!("cannot convert `{text}` to {ty}"))
}

fn parse_list(text: &str, elem: &TypeDecl, engine: &mut dyn ScriptEngine) -> Result<Value, Error> {
    if text.is_empty() {
        return Ok(Value::List(Vec::new()));
    }
    let flat_elem = elem.ty.is_scalar() || matches!(elem.ty, TypeDescriptor::Enum(_));
    let pieces = if !text.starts_with('[') {
        split_flat(text)
    } else {
        let groups = bracket_groups(text)?;
        if flat_elem && groups.len() == 1 && groups[0].len() + 2 == text.len() {
            split_flat(groups[0])
        } else {
            groups
        }
    };
    let mut items = Vec::with_capacity(pieces.len());
    for piece in pieces {
        items.push(parse_by_decl(piece.trim(), elem, engine)?);
    }
    Ok(Value::List(items))
}

/// Splits on `,` or `;`, dropping empty pieces.
fn split_flat(text: &str) -> Vec<&str> {
    text.split([',', ';'])
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Interiors of the top-level `[...]` groups in `text`, nested groups left intact.
pub fn bracket_groups(text: &str) -> Result<Vec<&str>, Error> {
    let mut groups = Vec::new();
    let mut depth = 0usize;
    let mut open = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '[' => {
                if depth == 0 {
                    open = idx;
                }
                depth += 1;
            }
            ']' => {
                if depth == 0 {
                    return Err(Error::new(ErrorKind::Conversion)
                        .with_message(format!("unbalanced `]` in `{text}`")));
                }
                depth -= 1;
                if depth == 0 {
                    groups.push(&text[open + 1..idx]);
                }
            }
            ',' | ';' => {}
            ch if depth == 0 && !ch.is_whitespace() => {
                return Err(Error::new(ErrorKind::Conversion)
                    .with_message(format!("unexpected `{ch}` outside brackets in `{text}`")));
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::new(ErrorKind::Conversion)
            .with_message(format!("unbalanced `[` in `{text}`")));
    }
    Ok(groups)
}

/// Drops one `[...]` pair when it encloses the whole text.
fn unwrap_brackets(text: &str) -> &str {
    if !text.starts_with('[') || !text.ends_with(']') {
        return text;
    }
    let mut depth = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return if idx + 1 == text.len() {
                        &text[1..idx]
                    } else {
                        text
                    };
                }
            }
            _ => {}
        }
    }
    text
}

fn parse_dict(
    text: &str,
    fields: &[(String, TypeDecl)],
    engine: &mut dyn ScriptEngine,
) -> Result<Value, Error> {
    let body = unwrap_brackets(text).trim();
    let mut raw: Vec<(&str, &str)> = Vec::new();
    if !body.is_empty() {
        // (key start, '=' index) per entry, found at bracket depth 0.
        let mut marks: Vec<(usize, usize)> = Vec::new();
        let mut depth = 0usize;
        let mut segment_start = 0usize;
        for (idx, ch) in body.char_indices() {
            match ch {
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => segment_start = idx + 1,
                '=' if depth == 0 => marks.push((segment_start, idx)),
                _ => {}
            }
        }
        match marks.first() {
            None => {
                return Err(Error::new(ErrorKind::Conversion)
                    .with_message(format!("expected `key=value` pairs, got `{body}`")));
            }
            Some((0, _)) => {}
            Some(_) => {
                return Err(Error::new(ErrorKind::Conversion)
                    .with_message(format!("unexpected text before first key in `{body}`")));
            }
        }
        for (pos, (key_start, eq)) in marks.iter().enumerate() {
            let value_end = match marks.get(pos + 1) {
                Some((next_start, _)) => next_start.saturating_sub(1),
                None => body.len(),
            };
            let key = body[*key_start..*eq].trim();
            let value = body[eq + 1..value_end.max(eq + 1)].trim();
            raw.push((key, value));
        }
    }

    let mut map = BTreeMap::new();
    for (key, value) in raw {
        let Some((_, decl)) = fields.iter().find(|(name, _)| name == key) else {
            return Err(Error::new(ErrorKind::Conversion)
                .with_message(format!("key `{key}` is not declared in the Dict")));
        };
        if map.contains_key(key) {
            return Err(Error::new(ErrorKind::Conversion)
                .with_message(format!("duplicate Dict key `{key}`")));
        }
        map.insert(key.to_string(), parse_by_decl(value, decl, engine)?);
    }
    for (name, decl) in fields {
        if map.contains_key(name) {
            continue;
        }
        if let Some(default) = &decl.default {
            map.insert(name.clone(), Value::from(default.clone()));
        }
    }
    Ok(Value::Map(map))
}
