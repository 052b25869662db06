//! Purpose: Pure encoders from the table model to on-disk bytes.
//! Exports: `Format`, `Encoded`, `encode`, `manifest_order`.
//! Role: Called by workers after the primary read and by the coordinator on rewrite.
//! Invariants: Output is a function of (column order, row order, rows) only.
//! Invariants: Map keys are always emitted sorted.
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::table::{RowRecord, RowTable, TableData, TableExport};

pub mod lua_table;
pub mod record;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Keyed Lua table with a field-name accessor.
    #[default]
    Lua,
    /// Tab-indented JSON objects.
    Json,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Lua => "lua",
            Format::Json => "json",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lua" => Ok(Format::Lua),
            "json" => Ok(Format::Json),
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown output format `{other}`"))
                .with_hint("Use `lua` or `json`.")),
        }
    }
}

/// Encoded output of one table, before it touches the filesystem.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Encoded {
    Aggregate(Vec<u8>),
    PerRow {
        rows: Vec<(String, Vec<u8>)>,
        index: Vec<u8>,
    },
}

pub fn encode(format: Format, export: &TableExport) -> Result<Encoded, Error> {
    let encoded = match &export.data {
        TableData::Map(map) => Encoded::Aggregate(match format {
            Format::Lua => lua_table::map(map).into_bytes(),
            Format::Json => record::map(map)?,
        }),
        TableData::Rows(table) if export.one_row_one_file => {
            let ordered = manifest_order(table);
            let mut rows = Vec::with_capacity(ordered.len());
            for record in &ordered {
                let bytes = match format {
                    Format::Lua => lua_table::row(table, record).into_bytes(),
                    Format::Json => record::row(table, record)?,
                };
                rows.push((record.key.clone(), bytes));
            }
            let index = match format {
                Format::Lua => lua_table::manifest(&ordered).into_bytes(),
                Format::Json => record::manifest(&ordered)?,
            };
            Encoded::PerRow { rows, index }
        }
        TableData::Rows(table) => Encoded::Aggregate(match format {
            Format::Lua => lua_table::aggregate(table).into_bytes(),
            Format::Json => record::aggregate(table)?,
        }),
    };
    Ok(encoded)
}

/// Rows for manifests: integer identities ascending, then the rest lexicographically.
pub fn manifest_order(table: &RowTable) -> Vec<&RowRecord> {
    let mut ordered: Vec<&RowRecord> = table.ordered_rows().collect();
    ordered.sort_by(|a, b| {
        match (a.key.parse::<i64>(), b.key.parse::<i64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.key.cmp(&b.key)),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => a.key.cmp(&b.key),
        }
    });
    ordered
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::HashMap;

    use crate::core::table::{RowRecord, RowTable};
    use crate::core::value::Value;

    pub fn table(column_keys: &[&str], rows: Vec<Vec<Value>>) -> RowTable {
        let mut table = RowTable {
            column_keys: column_keys.iter().map(|key| key.to_string()).collect(),
            row_keys: Vec::new(),
            rows: HashMap::new(),
        };
        for values in rows {
            let key = values[0].identity_key().expect("identity");
            table.row_keys.push(key.clone());
            table.rows.insert(key.clone(), RowRecord { key, values });
        }
        table
    }
}
