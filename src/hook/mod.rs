//! Purpose: Narrow seam between the exporter and an embedded scripting engine.
//! Exports: `ScriptEngine`, `CacheProtocol`, `HookBridge`, `HookRef`, `ChangedSet`, `NoHooks`, `LuaHooks`.
//! Role: Column hooks and Func expressions run on per-worker engines; the cross-table
//!       cache protocol runs on one shared engine.
//! Invariants: Worker engines are never shared between threads and need no locking.
//! Invariants: The shared cache engine serializes every call through one mutex.
//! Invariants: Engine faults surface as `ErrorKind::Engine`, never as panics.
use std::collections::BTreeMap;

use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

mod lua;

pub use lua::LuaHooks;

/// Rows a post-pass wants rewritten: table name -> row identity -> row data.
pub type ChangedSet = BTreeMap<String, BTreeMap<String, Value>>;

/// Handle to a resolved per-column hook.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HookRef {
    name: String,
}

impl HookRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-worker evaluator: column hooks plus numeric expression evaluation.
pub trait ScriptEngine {
    /// Resolves the hook for `(table, column)`; `None` falls through to built-in parsing.
    fn lookup_hook(&mut self, table: &str, column: &str) -> Result<Option<HookRef>, Error>;

    fn call_hook(&mut self, hook: &HookRef, text: &str) -> Result<Value, Error>;

    /// Evaluates `expr` with the variable `x` bound.
    fn eval_number(&mut self, expr: &str, x: f64) -> Result<f64, Error>;
}

/// Cross-table aggregation protocol, run on one shared engine.
pub trait CacheProtocol: Send + Sync {
    /// Tables whose rows the post-pass wants; empty when no global script exists.
    fn init(&self) -> Result<Vec<String>, Error>;

    fn receive(&self, table: &str, data: &Value) -> Result<(), Error>;

    fn process_all(&self) -> Result<(), Error>;

    fn get_changed(&self) -> Result<ChangedSet, Error>;

    /// Whether a global script was found; without one there is no secondary phase.
    fn is_enabled(&self) -> bool;
}

pub trait HookBridge: Send + Sync {
    /// Builds a fresh engine owned by the calling worker.
    fn worker_engine(&self) -> Result<Box<dyn ScriptEngine>, Error>;

    fn cache(&self) -> &dyn CacheProtocol;
}

/// Bridge with no scripts at all: built-in parsing only, no secondary phase.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl ScriptEngine for NoHooks {
    fn lookup_hook(&mut self, _table: &str, _column: &str) -> Result<Option<HookRef>, Error> {
        Ok(None)
    }

    fn call_hook(&mut self, hook: &HookRef, _text: &str) -> Result<Value, Error> {
        Err(Error::new(ErrorKind::Engine)
            .with_message(format!("no scripting engine to run hook `{}`", hook.name())))
    }

    fn eval_number(&mut self, expr: &str, _x: f64) -> Result<f64, Error> {
        Err(Error::new(ErrorKind::Engine)
            .with_message(format!("no scripting engine to evaluate `{expr}`")))
    }
}

impl CacheProtocol for NoHooks {
    fn init(&self) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }

    fn receive(&self, _table: &str, _data: &Value) -> Result<(), Error> {
        Ok(())
    }

    fn process_all(&self) -> Result<(), Error> {
        Ok(())
    }

    fn get_changed(&self) -> Result<ChangedSet, Error> {
        Ok(ChangedSet::new())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

impl HookBridge for NoHooks {
    fn worker_engine(&self) -> Result<Box<dyn ScriptEngine>, Error> {
        Ok(Box::new(NoHooks))
    }

    fn cache(&self) -> &dyn CacheProtocol {
        self
    }
}
