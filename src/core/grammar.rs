//! Purpose: Parse header-cell type declarations into `TypeDecl` trees.
//! Exports: `TypeDescriptor`, `TypeDecl`, `parse_type`, `parse_bool`.
//! Role: Leaf of the export pipeline; builds one immutable descriptor per column.
//! Invariants: Parsing is pure and deterministic; equal text gives equal trees.
//! Invariants: Malformed declarations are `Grammar` errors; no type is ever substituted.
//! Notes: Empty text (or `Nil`) means "column unused"; callers must not coerce it to a value.
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Value as JsonValue, json};

use crate::core::error::{Error, ErrorKind};
use crate::core::value::Scalar;

#[derive(Clone, Debug, PartialEq)]
pub enum TypeDescriptor {
    Nil,
    Int,
    Float,
    Str,
    Bool,
    List(Box<TypeDecl>),
    Dict(Vec<(String, TypeDecl)>),
    Enum(Vec<(String, i64)>),
    Func(String),
}

/// A descriptor plus the literal substituted for empty cells.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeDecl {
    pub ty: TypeDescriptor,
    pub default: Option<Scalar>,
}

impl TypeDecl {
    pub fn new(ty: TypeDescriptor) -> Self {
        Self { ty, default: None }
    }

    pub fn with_default(mut self, default: Scalar) -> Self {
        self.default = Some(default);
        self
    }

    pub fn nil() -> Self {
        Self::new(TypeDescriptor::Nil)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.ty, TypeDescriptor::Nil)
    }

    /// JSON view used by `sheetport types`.
    pub fn describe(&self) -> JsonValue {
        let mut out = self.ty.describe();
        if let (Some(default), Some(obj)) = (&self.default, out.as_object_mut()) {
            obj.insert("default".to_string(), json!(default));
        }
        out
    }
}

impl TypeDescriptor {
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            TypeDescriptor::Int | TypeDescriptor::Float | TypeDescriptor::Str | TypeDescriptor::Bool
        )
    }

    fn describe(&self) -> JsonValue {
        match self {
            TypeDescriptor::Nil => json!({ "type": "Nil" }),
            TypeDescriptor::Int => json!({ "type": "Int" }),
            TypeDescriptor::Float => json!({ "type": "Float" }),
            TypeDescriptor::Str => json!({ "type": "Str" }),
            TypeDescriptor::Bool => json!({ "type": "Bool" }),
            TypeDescriptor::List(elem) => json!({ "type": "List", "elem": elem.describe() }),
            TypeDescriptor::Dict(fields) => {
                let fields = fields
                    .iter()
                    .map(|(name, decl)| json!({ "name": name, "decl": decl.describe() }))
                    .collect::<Vec<_>>();
                json!({ "type": "Dict", "fields": fields })
            }
            TypeDescriptor::Enum(members) => {
                let members = members
                    .iter()
                    .map(|(name, code)| json!({ "name": name, "code": code }))
                    .collect::<Vec<_>>();
                json!({ "type": "Enum", "members": members })
            }
            TypeDescriptor::Func(tag) => json!({ "type": "Func", "tag": tag }),
        }
    }
}

impl fmt::Display for TypeDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        match &self.default {
            None => Ok(()),
            Some(Scalar::Int(v)) => match &self.ty {
                TypeDescriptor::Enum(members) => {
                    match members.iter().find(|(_, code)| code == v) {
                        Some((name, _)) => write!(f, "={name}"),
                        None => write!(f, "={v}"),
                    }
                }
                _ => write!(f, "={v}"),
            },
            Some(Scalar::Float(v)) => write!(f, "={v}"),
            Some(Scalar::Str(v)) => write!(f, "={v}"),
            Some(Scalar::Bool(v)) => write!(f, "={v}"),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Nil => write!(f, "Nil"),
            TypeDescriptor::Int => write!(f, "Int"),
            TypeDescriptor::Float => write!(f, "Float"),
            TypeDescriptor::Str => write!(f, "Str"),
            TypeDescriptor::Bool => write!(f, "Bool"),
            TypeDescriptor::List(elem) => write!(f, "List({elem})"),
            TypeDescriptor::Dict(fields) => {
                write!(f, "Dict(")?;
                for (idx, (name, decl)) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{name}:{decl}")?;
                }
                write!(f, ")")
            }
            TypeDescriptor::Enum(members) => {
                write!(f, "Enum(")?;
                for (idx, (name, code)) in members.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{name}:{code}")?;
                }
                write!(f, ")")
            }
            TypeDescriptor::Func(tag) => write!(f, "Func({tag})"),
        }
    }
}

fn type_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<head>[A-Za-z_]\w*)(?:\((?P<body>.*)\))?$").expect("valid type pattern")
    })
}

fn ident_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_]\w*$").expect("valid ident pattern"))
}

fn grammar_error(text: &str, message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Grammar)
        .with_message(message)
        .with_hint(format!("declaration: `{text}`"))
}

/// Parses one header cell. All whitespace is insignificant in declarations.
pub fn parse_type(text: &str) -> Result<TypeDecl, Error> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    parse_decl(&compact)
}

fn parse_decl(text: &str) -> Result<TypeDecl, Error> {
    if text.is_empty() {
        return Ok(TypeDecl::nil());
    }
    let (name, default) = split_default(text)?;
    let caps = type_name_pattern()
        .captures(name)
        .ok_or_else(|| grammar_error(text, format!("malformed type name `{name}`")))?;
    let head = caps.name("head").map(|m| m.as_str()).unwrap_or_default();
    let body = caps.name("body").map(|m| m.as_str());

    match (head, body) {
        ("Nil", None) => {
            if default.is_some() {
                return Err(grammar_error(text, "Nil takes no default"));
            }
            Ok(TypeDecl::nil())
        }
        ("Int", None) => scalar_decl(text, TypeDescriptor::Int, default),
        ("Float", None) => scalar_decl(text, TypeDescriptor::Float, default),
        ("Str", None) => scalar_decl(text, TypeDescriptor::Str, default),
        ("Bool", None) => scalar_decl(text, TypeDescriptor::Bool, default),
        ("List", Some(body)) => {
            reject_default(text, "List", default)?;
            check_balanced(text, body)?;
            let elem = parse_decl(body)?;
            if elem.is_nil() {
                return Err(grammar_error(text, "List requires an element type"));
            }
            Ok(TypeDecl::new(TypeDescriptor::List(Box::new(elem))))
        }
        ("Dict", Some(body)) => {
            reject_default(text, "Dict", default)?;
            let mut fields: Vec<(String, TypeDecl)> = Vec::new();
            for (key, decl_text) in split_pairs(text, body)? {
                let decl = parse_decl(decl_text)?;
                if decl.is_nil() {
                    return Err(grammar_error(text, format!("Dict field `{key}` has no type")));
                }
                fields.push((key.to_string(), decl));
            }
            Ok(TypeDecl::new(TypeDescriptor::Dict(fields)))
        }
        ("Enum", Some(body)) => {
            let mut members: Vec<(String, i64)> = Vec::new();
            for (key, code_text) in split_pairs(text, body)? {
                let code = code_text.parse::<i64>().map_err(|_| {
                    grammar_error(text, format!("Enum member `{key}` needs an Int code, got `{code_text}`"))
                })?;
                members.push((key.to_string(), code));
            }
            let mut decl = TypeDecl::new(TypeDescriptor::Enum(Vec::new()));
            if let Some(default) = default {
                let (_, code) = members
                    .iter()
                    .find(|(name, _)| name == default)
                    .ok_or_else(|| {
                        grammar_error(text, format!("Enum default `{default}` is not a member"))
                    })?;
                decl = decl.with_default(Scalar::Int(*code));
            }
            decl.ty = TypeDescriptor::Enum(members);
            Ok(decl)
        }
        ("Func", Some(tag)) => {
            if !ident_pattern().is_match(tag) {
                return Err(grammar_error(text, format!("Func tag `{tag}` must be an identifier")));
            }
            let mut decl = TypeDecl::new(TypeDescriptor::Func(tag.to_string()));
            if let Some(default) = default {
                decl = decl.with_default(parse_numeric_default(text, default)?);
            }
            Ok(decl)
        }
        ("Int" | "Float" | "Str" | "Bool" | "Nil", Some(_)) => {
            Err(grammar_error(text, format!("{head} takes no parameters")))
        }
        ("List" | "Dict" | "Enum" | "Func", None) => {
            Err(grammar_error(text, format!("{head} requires a parenthesized body")))
        }
        _ => Err(grammar_error(text, format!("unknown type `{head}`"))),
    }
}

/// Splits `NAME=VALUE` at the first `=` outside parentheses.
fn split_default(text: &str) -> Result<(&str, Option<&str>), Error> {
    let mut depth = 0i32;
    for (idx, ch) in text.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(grammar_error(text, "unbalanced `)`"));
                }
            }
            '=' if depth == 0 => {
                let default = &text[idx + 1..];
                let default = if default.is_empty() { None } else { Some(default) };
                return Ok((&text[..idx], default));
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(grammar_error(text, "unbalanced `(`"));
    }
    Ok((text, None))
}

fn check_balanced(text: &str, body: &str) -> Result<(), Error> {
    let mut depth = 0i32;
    for ch in body.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(grammar_error(text, "unbalanced parentheses"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(grammar_error(text, "unbalanced parentheses"));
    }
    Ok(())
}

/// Splits a `key:decl,key:decl` body on commas at depth 0.
fn split_pairs<'a>(text: &str, body: &'a str) -> Result<Vec<(&'a str, &'a str)>, Error> {
    check_balanced(text, body)?;
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (idx, ch) in body.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&body[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);

    let mut pairs: Vec<(&str, &str)> = Vec::with_capacity(parts.len());
    for part in parts {
        let (key, value) = part
            .split_once(':')
            .ok_or_else(|| grammar_error(text, format!("expected `key:type`, got `{part}`")))?;
        if !ident_pattern().is_match(key) {
            return Err(grammar_error(text, format!("key `{key}` must be an identifier")));
        }
        if pairs.iter().any(|(existing, _)| *existing == key) {
            return Err(grammar_error(text, format!("duplicate key `{key}`")));
        }
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn reject_default(text: &str, head: &str, default: Option<&str>) -> Result<(), Error> {
    match default {
        Some(_) => Err(grammar_error(text, format!("{head} takes no default"))),
        None => Ok(()),
    }
}

fn scalar_decl(text: &str, ty: TypeDescriptor, default: Option<&str>) -> Result<TypeDecl, Error> {
    let Some(literal) = default else {
        return Ok(TypeDecl::new(ty));
    };
    let scalar = match ty {
        TypeDescriptor::Int => literal
            .parse::<i64>()
            .map(Scalar::Int)
            .map_err(|_| grammar_error(text, format!("Int default `{literal}` is not an integer")))?,
        TypeDescriptor::Float => literal
            .parse::<f64>()
            .map(Scalar::Float)
            .map_err(|_| grammar_error(text, format!("Float default `{literal}` is not a number")))?,
        TypeDescriptor::Bool => parse_bool(literal)
            .map(Scalar::Bool)
            .ok_or_else(|| grammar_error(text, format!("Bool default `{literal}` is not a boolean")))?,
        TypeDescriptor::Str => {
            if literal.starts_with('"') || literal.ends_with('"') {
                return Err(grammar_error(text, "Str defaults are written without quotes"));
            }
            Scalar::Str(literal.to_string())
        }
        _ => return Err(Error::new(ErrorKind::Internal).with_message("scalar_decl on container")),
    };
    Ok(TypeDecl::new(ty).with_default(scalar))
}

fn parse_numeric_default(text: &str, literal: &str) -> Result<Scalar, Error> {
    if let Ok(value) = literal.parse::<i64>() {
        return Ok(Scalar::Int(value));
    }
    literal
        .parse::<f64>()
        .map(Scalar::Float)
        .map_err(|_| grammar_error(text, format!("Func default `{literal}` is not a number")))
}

/// Boolean spellings accepted in defaults and cells.
pub fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
