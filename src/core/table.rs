//! Purpose: Turn one sheet's text rows into an ordered column/row model.
//! Exports: `ColumnBinding`, `RowRecord`, `RowTable`, `TableData`, `TableExport`, `read_table`.
//! Role: Drives the header protocol (type row, range row, name row) and the data-row scan.
//! Invariants: Column and row orderings are captured once here and never re-derived.
//! Invariants: Rows are dropped when empty, keyless, or switched off by the export flag.
//! Notes: Map-shaped tables skip the header protocol and read `(key, value, type)` rows.
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::core::cell::{CellContext, parse_value};
use crate::core::error::{Error, ErrorKind};
use crate::core::grammar::{TypeDecl, parse_type};
use crate::core::value::Value;
use crate::hook::{HookRef, ScriptEngine};

/// First-cell marker for rows that precede the header rows.
pub const SKIP_ROW_MARKER: &str = "skiprow";
/// Reserved column gating row inclusion; never exported.
pub const EXPORT_FLAG_COLUMN: &str = "ExportTable";

#[derive(Clone, Debug)]
pub struct ColumnBinding {
    pub key: String,
    pub index: usize,
    pub decl: TypeDecl,
    pub hook: Option<HookRef>,
}

impl ColumnBinding {
    pub fn is_export_flag(&self) -> bool {
        self.key == EXPORT_FLAG_COLUMN
    }

    /// Whether the column contributes a value to each exported row.
    pub fn is_included(&self) -> bool {
        !self.key.is_empty()
            && !self.is_export_flag()
            && (!self.decl.is_nil() || self.hook.is_some())
    }

    fn label(&self) -> String {
        if self.key.is_empty() {
            format!("#{}", self.index + 1)
        } else {
            self.key.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RowRecord {
    pub key: String,
    /// Aligned with `RowTable::column_keys`.
    pub values: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowTable {
    pub column_keys: Vec<String>,
    pub row_keys: Vec<String>,
    pub rows: HashMap<String, RowRecord>,
}

impl RowTable {
    pub fn ordered_rows(&self) -> impl Iterator<Item = &RowRecord> + '_ {
        self.row_keys.iter().filter_map(|key| self.rows.get(key))
    }

    pub fn row_fields(&self, record: &RowRecord) -> BTreeMap<String, Value> {
        self.column_keys
            .iter()
            .cloned()
            .zip(record.values.iter().cloned())
            .collect()
    }

    /// Overlays changed fields onto existing rows; returns how many rows changed.
    pub fn apply_changes(
        &mut self,
        table: &str,
        changes: &BTreeMap<String, Value>,
    ) -> Result<usize, Error> {
        let RowTable {
            column_keys, rows, ..
        } = self;
        let mut applied = 0usize;
        for (row_key, change) in changes {
            let Some(record) = rows.get_mut(row_key) else {
                warn!(table, row = %row_key, "changed row is not part of the export; ignored");
                continue;
            };
            let fields = match change {
                Value::Map(fields) => fields,
                Value::List(items) if items.is_empty() => continue,
                other => {
                    return Err(Error::new(ErrorKind::Engine)
                        .with_message(format!(
                            "changed row `{row_key}` must be a table of fields, got {}",
                            other.type_name()
                        ))
                        .with_table(table));
                }
            };
            for (field, value) in fields {
                match column_keys.iter().position(|key| key == field) {
                    Some(0) if record.values[0] != *value => {
                        warn!(table, row = %row_key, "row identity cannot be changed; ignored");
                    }
                    Some(pos) => record.values[pos] = value.clone(),
                    None => {
                        warn!(table, row = %row_key, field = %field, "changed field is not a column; ignored");
                    }
                }
            }
            applied += 1;
        }
        Ok(applied)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TableData {
    Rows(RowTable),
    Map(BTreeMap<String, Value>),
}

impl TableData {
    /// Row-keyed view handed to the cache protocol.
    pub fn to_value(&self) -> Value {
        match self {
            TableData::Rows(table) => Value::Map(
                table
                    .ordered_rows()
                    .map(|record| (record.key.clone(), Value::Map(table.row_fields(record))))
                    .collect(),
            ),
            TableData::Map(map) => Value::Map(map.clone()),
        }
    }

    pub fn apply_changes(
        &mut self,
        table: &str,
        changes: &BTreeMap<String, Value>,
    ) -> Result<usize, Error> {
        match self {
            TableData::Rows(rows) => rows.apply_changes(table, changes),
            TableData::Map(map) => {
                let mut applied = 0usize;
                for (key, value) in changes {
                    match map.get_mut(key) {
                        Some(slot) => {
                            *slot = value.clone();
                            applied += 1;
                        }
                        None => warn!(table, key = %key, "changed key is not part of the export; ignored"),
                    }
                }
                Ok(applied)
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TableData::Rows(rows) => rows.row_keys.len(),
            TableData::Map(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One table's primary-export result, kept for the rest of the run.
#[derive(Clone, Debug, PartialEq)]
pub struct TableExport {
    pub name: String,
    pub one_row_one_file: bool,
    pub data: TableData,
}

pub fn read_table(
    name: &str,
    is_map: bool,
    rows: &[Vec<String>],
    engine: &mut dyn ScriptEngine,
) -> Result<TableData, Error> {
    if is_map {
        read_map_rows(name, rows, engine).map(TableData::Map)
    } else {
        read_row_table(name, rows, engine).map(TableData::Rows)
    }
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

fn first_content_row(rows: &[Vec<String>]) -> usize {
    rows.iter()
        .position(|row| cell(row, 0).trim() != SKIP_ROW_MARKER)
        .unwrap_or(rows.len())
}

fn read_bindings(
    name: &str,
    header_start: usize,
    type_row: &[String],
    name_row: &[String],
    engine: &mut dyn ScriptEngine,
) -> Result<Vec<ColumnBinding>, Error> {
    let width = type_row.len().max(name_row.len());
    let mut bindings = Vec::with_capacity(width);
    for index in 0..width {
        let key: String = cell(name_row, index)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let decl = parse_type(cell(type_row, index)).map_err(|err| {
            let label = if key.is_empty() {
                format!("#{}", index + 1)
            } else {
                key.clone()
            };
            err.or_context(name, Some(header_start + 1), Some(&label))
        })?;
        let hook = if key.is_empty() {
            None
        } else {
            engine.lookup_hook(name, &key)?
        };
        bindings.push(ColumnBinding {
            key,
            index,
            decl,
            hook,
        });
    }

    let mut seen: Vec<&str> = Vec::new();
    for binding in bindings.iter().filter(|b| b.is_included() || b.is_export_flag()) {
        if seen.contains(&binding.key.as_str()) {
            return Err(Error::new(ErrorKind::Grammar)
                .with_message(format!("duplicate column `{}`", binding.key))
                .with_table(name)
                .with_row(header_start + 3));
        }
        seen.push(&binding.key);
    }
    Ok(bindings)
}

fn read_row_table(
    name: &str,
    rows: &[Vec<String>],
    engine: &mut dyn ScriptEngine,
) -> Result<RowTable, Error> {
    let start = first_content_row(rows);
    let (Some(type_row), Some(_range_row), Some(name_row)) =
        (rows.get(start), rows.get(start + 1), rows.get(start + 2))
    else {
        return Err(Error::new(ErrorKind::Grammar)
            .with_message("expected type, range and name header rows")
            .with_table(name));
    };
    let bindings = read_bindings(name, start, type_row, name_row, engine)?;
    let included: Vec<&ColumnBinding> = bindings.iter().filter(|b| b.is_included()).collect();
    let flag = bindings.iter().find(|b| b.is_export_flag());
    let Some((identity, others)) = included.split_first() else {
        return Err(Error::new(ErrorKind::Grammar)
            .with_message("table declares no exported columns")
            .with_table(name));
    };

    let mut table = RowTable {
        column_keys: included.iter().map(|b| b.key.clone()).collect(),
        ..RowTable::default()
    };

    let data_start = start + 3;
    for (offset, row) in rows[data_start..].iter().enumerate() {
        let sheet_row = data_start + offset + 1;
        if row.is_empty() {
            continue;
        }
        let identity_text = cell(row, identity.index);
        if identity_text.trim().is_empty() && identity.hook.is_none() {
            debug!(table = name, row = sheet_row, "row has no identity; dropped");
            continue;
        }
        let identity_value = parse_cell(name, row, identity, engine, sheet_row)?;
        if identity_value.is_nil() {
            debug!(table = name, row = sheet_row, "row identity is nil; dropped");
            continue;
        }

        if let Some(flag) = flag {
            match parse_cell(name, row, flag, engine, sheet_row)? {
                Value::Bool(true) => {}
                Value::Bool(false) => {
                    debug!(table = name, row = sheet_row, "export flag is off; dropped");
                    continue;
                }
                other => {
                    return Err(Error::new(ErrorKind::Conversion)
                        .with_message(format!(
                            "{EXPORT_FLAG_COLUMN} must be Bool, got {}",
                            other.type_name()
                        ))
                        .with_table(name)
                        .with_row(sheet_row)
                        .with_column(EXPORT_FLAG_COLUMN));
                }
            }
        }

        let key = identity_value
            .identity_key()
            .map_err(|err| err.or_context(name, Some(sheet_row), Some(&identity.key)))?;
        let mut values = Vec::with_capacity(included.len());
        values.push(identity_value);
        for binding in others {
            values.push(parse_cell(name, row, binding, engine, sheet_row)?);
        }

        if table.rows.contains_key(&key) {
            return Err(Error::new(ErrorKind::Conversion)
                .with_message(format!("duplicate row identity `{key}`"))
                .with_table(name)
                .with_row(sheet_row)
                .with_column(identity.key.clone()));
        }
        table.row_keys.push(key.clone());
        table.rows.insert(key.clone(), RowRecord { key, values });
    }
    Ok(table)
}

fn parse_cell(
    table: &str,
    row: &[String],
    binding: &ColumnBinding,
    engine: &mut dyn ScriptEngine,
    sheet_row: usize,
) -> Result<Value, Error> {
    let label = binding.label();
    parse_value(
        cell(row, binding.index),
        &binding.decl,
        binding.hook.as_ref(),
        engine,
        CellContext {
            table,
            row: sheet_row,
            column: &label,
        },
    )
}

fn read_map_rows(
    name: &str,
    rows: &[Vec<String>],
    engine: &mut dyn ScriptEngine,
) -> Result<BTreeMap<String, Value>, Error> {
    let start = first_content_row(rows);
    let mut map = BTreeMap::new();
    for (offset, row) in rows[start..].iter().enumerate() {
        let sheet_row = start + offset + 1;
        let key: String = cell(row, 0).chars().filter(|c| !c.is_whitespace()).collect();
        if key.is_empty() {
            continue;
        }
        let decl = parse_type(cell(row, 2))
            .map_err(|err| err.or_context(name, Some(sheet_row), Some(&key)))?;
        let hook = engine.lookup_hook(name, &key)?;
        if decl.is_nil() && hook.is_none() {
            debug!(table = name, row = sheet_row, key = %key, "entry has no type; skipped");
            continue;
        }
        let value = parse_value(
            cell(row, 1),
            &decl,
            hook.as_ref(),
            engine,
            CellContext {
                table: name,
                row: sheet_row,
                column: &key,
            },
        )?;
        if map.contains_key(&key) {
            return Err(Error::new(ErrorKind::Conversion)
                .with_message(format!("duplicate key `{key}`"))
                .with_table(name)
                .with_row(sheet_row));
        }
        map.insert(key, value);
    }
    Ok(map)
}
