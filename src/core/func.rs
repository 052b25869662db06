//! Purpose: Reduce `Func(...)` cells to numeric constants or coefficient lists.
//! Exports: `parse_func`, `quadratic_coefficients`.
//! Role: Func branch of the cell parser; expressions are evaluated by the worker's engine.
//! Invariants: Quadratic terms come from three samples, f(0), f(1), f(-1).
//! Invariants: Unprefixed text is a bare numeric constant.
use crate::core::cell::bracket_groups;
use crate::core::error::{Error, ErrorKind};
use crate::core::value::{Scalar, Value};
use crate::hook::ScriptEngine;

pub const CONST_PREFIX: &str = "Const:";
pub const QUADRATIC_PREFIX: &str = "Func1:";
pub const PIECEWISE_PREFIX: &str = "Switch:";

pub fn parse_func(
    text: &str,
    tag: &str,
    default: Option<&Scalar>,
    engine: &mut dyn ScriptEngine,
) -> Result<Value, Error> {
    if text.is_empty() {
        return Ok(default.cloned().map(Value::from).unwrap_or(Value::Int(0)));
    }
    if let Some(rest) = text.strip_prefix(CONST_PREFIX) {
        return parse_number(rest.trim(), tag).map(Value::number);
    }
    if let Some(expr) = text.strip_prefix(QUADRATIC_PREFIX) {
        let coefficients = quadratic_coefficients(expr.trim(), engine)?;
        return Ok(coefficient_list(coefficients));
    }
    if let Some(rest) = text.strip_prefix(PIECEWISE_PREFIX) {
        return parse_piecewise(rest.trim(), tag, engine);
    }
    parse_number(text, tag).map(Value::number)
}

/// `[a, b, c]` for `a*x^2 + b*x + c`, solved from samples at 0, 1 and -1.
pub fn quadratic_coefficients(expr: &str, engine: &mut dyn ScriptEngine) -> Result<[f64; 3], Error> {
    if expr.is_empty() {
        return Err(Error::new(ErrorKind::Conversion).with_message("empty Func expression"));
    }
    let at_zero = engine.eval_number(expr, 0.0)?;
    let at_one = engine.eval_number(expr, 1.0)?;
    let at_minus_one = engine.eval_number(expr, -1.0)?;
    let c = at_zero;
    let b = (at_one - at_minus_one) / 2.0;
    let a = (at_one + at_minus_one) / 2.0 - c;
    Ok([a, b, c])
}

fn coefficient_list(coefficients: [f64; 3]) -> Value {
    Value::List(coefficients.into_iter().map(Value::number).collect())
}

fn parse_piecewise(text: &str, tag: &str, engine: &mut dyn ScriptEngine) -> Result<Value, Error> {
    let mut pieces = Vec::new();
    for group in bracket_groups(text)? {
        let mut parts = group.splitn(3, ',');
        let (Some(lo), Some(hi), Some(expr)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::new(ErrorKind::Conversion).with_message(format!(
                "Func({tag}) piece `[{group}]` must be `[low,high,expression]`"
            )));
        };
        let lo = parse_number(lo.trim(), tag)?;
        let hi = parse_number(hi.trim(), tag)?;
        let coefficients = quadratic_coefficients(expr.trim(), engine)?;
        pieces.push(Value::List(vec![
            Value::number(lo),
            Value::number(hi),
            coefficient_list(coefficients),
        ]));
    }
    if pieces.is_empty() {
        return Err(Error::new(ErrorKind::Conversion)
            .with_message(format!("Func({tag}) piecewise text has no pieces")));
    }
    Ok(Value::List(pieces))
}

fn parse_number(text: &str, tag: &str) -> Result<f64, Error> {
    text.parse::<f64>().map_err(|_| {
        Error::new(ErrorKind::Conversion)
            .with_message(format!("cannot convert `{text}` to a Func({tag}) constant"))
    })
}
