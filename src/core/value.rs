//! Purpose: Closed value model produced by cell parsing and consumed by encoders.
//! Exports: `Value`, `Scalar`.
//! Role: The only representation of parsed data; engines convert into it at the seam.
//! Invariants: Consumers match exhaustively; there is no untyped escape hatch.
//! Invariants: `Map` keys are ordered so every encoding of a value is deterministic.
use std::collections::BTreeMap;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Literal defaults that may follow `=` in a type declaration.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Int(v) => Value::Int(v),
            Scalar::Float(v) => Value::Float(v),
            Scalar::Str(v) => Value::Str(v),
            Scalar::Bool(v) => Value::Bool(v),
        }
    }
}

impl Value {
    /// Engine numbers collapse to `Int` when they carry no fraction.
    pub fn number(n: f64) -> Self {
        if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            Value::Int(n as i64)
        } else {
            Value::Float(n)
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "Nil",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "Str",
            Value::Bool(_) => "Bool",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
        }
    }

    /// Row identity form: strings verbatim, integers in decimal.
    pub fn identity_key(&self) -> Result<String, Error> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Nil
            | Value::Float(_)
            | Value::Bool(_)
            | Value::List(_)
            | Value::Map(_) => Err(Error::new(ErrorKind::Conversion).with_message(format!(
                "row identity must be Int or Str, got {}",
                self.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Scalar, Value};
    use crate::core::error::ErrorKind;

    #[test]
    fn integral_numbers_collapse_to_int() {
        assert_eq!(Value::number(3.0), Value::Int(3));
        assert_eq!(Value::number(-2.0), Value::Int(-2));
        assert_eq!(Value::number(2.5), Value::Float(2.5));
        assert!(matches!(Value::number(f64::NAN), Value::Float(_)));
    }

    #[test]
    fn identity_keys_accept_str_and_int_only() {
        assert_eq!(Value::Int(1001).identity_key().unwrap(), "1001");
        assert_eq!(Value::Str("sword".into()).identity_key().unwrap(), "sword");
        let err = Value::Float(1.5).identity_key().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
        let err = Value::Bool(true).identity_key().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
    }

    #[test]
    fn scalar_converts_variant_for_variant() {
        assert_eq!(Value::from(Scalar::Bool(true)), Value::Bool(true));
        assert_eq!(Value::from(Scalar::Str("a".into())), Value::Str("a".into()));
    }
}
