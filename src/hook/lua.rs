//! Purpose: Lua-backed hooks, Func evaluation and the cross-table cache protocol.
//! Exports: `LuaHooks`.
//! Role: Each worker gets its own `Lua` state; the cache protocol owns one more behind a mutex.
//! Invariants: Table scripts load lazily from `<hook_dir>/<Table>.lua`, at most once per state.
//! Invariants: Hooks are globals named `<Table>_<Column>`.
//! Invariants: A Lua table keyed exactly `1..n` (or empty) converts to a list; anything else to a map.
//! Notes: Integer-looking map keys are passed to Lua as integers so scripts can index rows by id.
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use mlua::{Function, Lua, Table};
use tracing::debug;

use super::{CacheProtocol, ChangedSet, HookBridge, HookRef, ScriptEngine};
use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

pub const GLOBAL_SCRIPT: &str = "GlobalProcess.lua";

const MAX_DEPTH: usize = 64;

/// Hook bridge over a directory of Lua scripts.
pub struct LuaHooks {
    hook_dir: PathBuf,
    cache: LuaCache,
}

impl LuaHooks {
    /// Loads the global script eagerly; table scripts load per worker on first use.
    pub fn new(hook_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let hook_dir = hook_dir.into();
        let cache = LuaCache::open(&hook_dir)?;
        Ok(Self { hook_dir, cache })
    }
}

impl HookBridge for LuaHooks {
    fn worker_engine(&self) -> Result<Box<dyn ScriptEngine>, Error> {
        Ok(Box::new(LuaEngine::new(self.hook_dir.clone())?))
    }

    fn cache(&self) -> &dyn CacheProtocol {
        &self.cache
    }
}

fn engine_error(context: impl std::fmt::Display, err: mlua::Error) -> Error {
    Error::new(ErrorKind::Engine).with_message(format!("{context}: {err}"))
}

fn new_state(hook_dir: &Path) -> Result<Lua, Error> {
    let lua = Lua::new();
    let package: Table = lua
        .globals()
        .get("package")
        .map_err(|err| engine_error("lua package table", err))?;
    let current: String = package
        .get("path")
        .map_err(|err| engine_error("lua package.path", err))?;
    package
        .set("path", format!("{}/?.lua;{current}", hook_dir.display()))
        .map_err(|err| engine_error("lua package.path", err))?;
    Ok(lua)
}

fn exec_file(lua: &Lua, path: &Path) -> Result<(), Error> {
    let source = fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read hook script")
            .with_path(path)
            .with_source(err)
    })?;
    lua.load(source.as_str())
        .set_name(path.display().to_string())
        .exec()
        .map_err(|err| engine_error(path.display(), err).with_path(path))
}

struct LuaEngine {
    lua: Lua,
    hook_dir: PathBuf,
    loaded: HashSet<String>,
}

impl LuaEngine {
    fn new(hook_dir: PathBuf) -> Result<Self, Error> {
        Ok(Self {
            lua: new_state(&hook_dir)?,
            hook_dir,
            loaded: HashSet::new(),
        })
    }

    fn ensure_table_script(&mut self, table: &str) -> Result<(), Error> {
        if !self.loaded.insert(table.to_string()) {
            return Ok(());
        }
        let path = self.hook_dir.join(format!("{table}.lua"));
        if !path.is_file() {
            return Ok(());
        }
        debug!(table, path = %path.display(), "loading table hooks");
        exec_file(&self.lua, &path)
    }
}

impl ScriptEngine for LuaEngine {
    fn lookup_hook(&mut self, table: &str, column: &str) -> Result<Option<HookRef>, Error> {
        self.ensure_table_script(table)?;
        let name = format!("{table}_{column}");
        let found: Option<Function> = self
            .lua
            .globals()
            .get(name.as_str())
            .map_err(|err| engine_error(format!("hook `{name}`"), err))?;
        Ok(found.map(|_| HookRef::new(name)))
    }

    fn call_hook(&mut self, hook: &HookRef, text: &str) -> Result<Value, Error> {
        let func: Function = self
            .lua
            .globals()
            .get(hook.name())
            .map_err(|err| engine_error(format!("hook `{}`", hook.name()), err))?;
        let result: mlua::Value = func
            .call(text)
            .map_err(|err| engine_error(format!("hook `{}`", hook.name()), err))?;
        from_lua(result, 0)
    }

    fn eval_number(&mut self, expr: &str, x: f64) -> Result<f64, Error> {
        // `x` is a parameter; the worker's globals are left untouched.
        let func: Function = self
            .lua
            .load(format!("return function(x) return ({expr}) end"))
            .set_name("func")
            .eval()
            .map_err(|err| engine_error(format!("expression `{expr}`"), err))?;
        func.call::<f64>(x)
            .map_err(|err| engine_error(format!("expression `{expr}`"), err))
    }
}

/// Shared engine running the global script; absent when no global script exists.
struct LuaCache {
    lua: Option<Mutex<Lua>>,
}

impl LuaCache {
    fn open(hook_dir: &Path) -> Result<Self, Error> {
        let path = hook_dir.join(GLOBAL_SCRIPT);
        if !path.is_file() {
            debug!(path = %path.display(), "no global script; cache protocol disabled");
            return Ok(Self { lua: None });
        }
        let lua = new_state(hook_dir)?;
        exec_file(&lua, &path)?;
        Ok(Self {
            lua: Some(Mutex::new(lua)),
        })
    }

    /// Calls a global function; a script that omits it behaves as if it returned nil.
    fn call(&self, name: &str, args: impl mlua::IntoLuaMulti) -> Result<Value, Error> {
        let Some(lua) = &self.lua else {
            return Ok(Value::Nil);
        };
        let lua = lua.lock().map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("cache engine lock poisoned")
        })?;
        let found: Option<Function> = lua
            .globals()
            .get(name)
            .map_err(|err| engine_error(name, err))?;
        let Some(func) = found else {
            debug!(function = name, "global script does not define function");
            return Ok(Value::Nil);
        };
        let result: mlua::Value = func.call(args).map_err(|err| engine_error(name, err))?;
        from_lua(result, 0)
    }
}

impl CacheProtocol for LuaCache {
    fn init(&self) -> Result<Vec<String>, Error> {
        match self.call("GlobalCacheDataList", ())? {
            Value::Nil => Ok(Vec::new()),
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Str(name) => Ok(name),
                    other => Err(Error::new(ErrorKind::Engine).with_message(format!(
                        "GlobalCacheDataList must return table names, got {}",
                        other.type_name()
                    ))),
                })
                .collect(),
            other => Err(Error::new(ErrorKind::Engine).with_message(format!(
                "GlobalCacheDataList must return a list, got {}",
                other.type_name()
            ))),
        }
    }

    fn receive(&self, table: &str, data: &Value) -> Result<(), Error> {
        let Some(lua) = &self.lua else {
            return Ok(());
        };
        let arg = {
            let lua = lua.lock().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("cache engine lock poisoned")
            })?;
            to_lua(&lua, data).map_err(|err| engine_error(format!("passing {table}"), err))?
        };
        self.call("ReceiveCacheData", (table, arg)).map(|_| ())
    }

    fn process_all(&self) -> Result<(), Error> {
        self.call("ProcessCacheData", ()).map(|_| ())
    }

    fn get_changed(&self) -> Result<ChangedSet, Error> {
        let tables = match self.call("GetChangedData", ())? {
            Value::Nil => return Ok(ChangedSet::new()),
            Value::Map(tables) => tables,
            Value::List(items) if items.is_empty() => return Ok(ChangedSet::new()),
            other => {
                return Err(Error::new(ErrorKind::Engine).with_message(format!(
                    "GetChangedData must return a table keyed by table name, got {}",
                    other.type_name()
                )));
            }
        };
        let mut changed = ChangedSet::new();
        for (table, rows) in tables {
            let rows = match rows {
                Value::Map(rows) => rows,
                // A table keyed 1..n arrives as a list; restore its integer row ids.
                Value::List(items) => items
                    .into_iter()
                    .enumerate()
                    .map(|(idx, row)| ((idx + 1).to_string(), row))
                    .collect(),
                other => {
                    return Err(Error::new(ErrorKind::Engine)
                        .with_message(format!(
                            "changed rows must be a table, got {}",
                            other.type_name()
                        ))
                        .with_table(table));
                }
            };
            changed.insert(table, rows);
        }
        Ok(changed)
    }

    fn is_enabled(&self) -> bool {
        self.lua.is_some()
    }
}

fn integer_key(key: &str) -> Option<i64> {
    key.parse::<i64>().ok().filter(|n| n.to_string() == key)
}

fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Nil => mlua::Value::Nil,
        Value::Int(n) => mlua::Value::Integer(*n),
        Value::Float(n) => mlua::Value::Number(*n),
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Str(s) => mlua::Value::String(lua.create_string(s)?),
        Value::List(items) => {
            let table = lua.create_table()?;
            for (idx, item) in items.iter().enumerate() {
                table.raw_set(idx + 1, to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Map(entries) => {
            let table = lua.create_table()?;
            for (key, item) in entries {
                let item = to_lua(lua, item)?;
                match integer_key(key) {
                    Some(n) => table.raw_set(n, item)?,
                    None => table.raw_set(key.as_str(), item)?,
                }
            }
            mlua::Value::Table(table)
        }
    })
}

fn from_lua(value: mlua::Value, depth: usize) -> Result<Value, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::new(ErrorKind::Engine).with_message("lua value is nested too deeply"));
    }
    match value {
        mlua::Value::Nil => Ok(Value::Nil),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(n) => Ok(Value::Int(n)),
        mlua::Value::Number(n) => Ok(Value::number(n)),
        mlua::Value::String(s) => Ok(Value::Str(s.to_string_lossy().to_string())),
        mlua::Value::Table(table) => table_from_lua(table, depth),
        other => Err(Error::new(ErrorKind::Engine).with_message(format!(
            "unsupported lua value of type {}",
            other.type_name()
        ))),
    }
}

fn table_from_lua(table: Table, depth: usize) -> Result<Value, Error> {
    let mut entries = Vec::new();
    for pair in table.pairs::<mlua::Value, mlua::Value>() {
        let (key, item) = pair.map_err(|err| engine_error("reading lua table", err))?;
        entries.push((key, from_lua(item, depth + 1)?));
    }

    let mut positional: Vec<Option<Value>> = vec![None; entries.len()];
    let mut sequence = true;
    for (key, item) in &entries {
        let slot = match key {
            mlua::Value::Integer(n) => usize::try_from(*n).ok(),
            _ => None,
        };
        match slot.filter(|n| (1..=positional.len()).contains(n)) {
            Some(n) if positional[n - 1].is_none() => positional[n - 1] = Some(item.clone()),
            _ => {
                sequence = false;
                break;
            }
        }
    }
    if sequence {
        return Ok(Value::List(positional.into_iter().flatten().collect()));
    }

    let mut map = BTreeMap::new();
    for (key, item) in entries {
        let key = match key {
            mlua::Value::Integer(n) => n.to_string(),
            mlua::Value::Number(n) => match Value::number(n) {
                Value::Int(i) => i.to_string(),
                _ => n.to_string(),
            },
            mlua::Value::String(s) => s.to_string_lossy().to_string(),
            mlua::Value::Boolean(b) => b.to_string(),
            other => {
                return Err(Error::new(ErrorKind::Engine).with_message(format!(
                    "unsupported lua table key of type {}",
                    other.type_name()
                )));
            }
        };
        map.insert(key, item);
    }
    Ok(Value::Map(map))
}
