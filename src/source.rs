//! Purpose: Turn a table definition into rows of text cells.
//! Exports: `SourceAdapter`, `XlsxSource`, `MemorySource`, `cell_text`.
//! Role: Collaborator of the coordinator; the only place that opens workbooks.
//! Invariants: Row and column positions match the sheet, leading blanks included.
//! Invariants: A missing workbook is `SourceMissing`; everything else unreadable is `Read`.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use calamine::{Data, Reader, Xlsx, open_workbook};

use crate::config::TableDef;
use crate::core::error::{Error, ErrorKind};

pub trait SourceAdapter: Send + Sync {
    fn exists(&self, def: &TableDef) -> bool;

    fn rows(&self, def: &TableDef) -> Result<Vec<Vec<String>>, Error>;
}

/// Reads `.xlsx` workbooks relative to a source directory.
#[derive(Clone, Debug)]
pub struct XlsxSource {
    src_dir: PathBuf,
}

impl XlsxSource {
    pub fn new(src_dir: impl Into<PathBuf>) -> Self {
        Self {
            src_dir: src_dir.into(),
        }
    }

    pub fn workbook_path(&self, def: &TableDef) -> PathBuf {
        self.src_dir.join(&def.excel)
    }
}

/// Text form of one cell as the type grammar expects to see it.
pub fn cell_text(cell: &Data) -> Result<String, String> {
    Ok(match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => return Err(format!("{e:?}")),
    })
}

fn read_error(def: &TableDef, path: &Path, message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Read)
        .with_message(message)
        .with_table(def.name.clone())
        .with_path(path)
}

impl SourceAdapter for XlsxSource {
    fn exists(&self, def: &TableDef) -> bool {
        self.workbook_path(def).is_file()
    }

    fn rows(&self, def: &TableDef) -> Result<Vec<Vec<String>>, Error> {
        let path = self.workbook_path(def);
        if !path.is_file() {
            return Err(Error::new(ErrorKind::SourceMissing)
                .with_message("workbook not found")
                .with_table(def.name.clone())
                .with_path(&path));
        }
        let mut workbook: Xlsx<_> = open_workbook(&path)
            .map_err(|err| read_error(def, &path, "failed to open workbook").with_source(err))?;
        let sheet = def.sheet_name();
        if !workbook.sheet_names().iter().any(|name| name == sheet) {
            return Err(read_error(def, &path, format!("sheet `{sheet}` not found"))
                .with_hint("Check the `sheet` field of the table definition."));
        }
        let range = workbook
            .worksheet_range(sheet)
            .map_err(|err| read_error(def, &path, "failed to read sheet").with_source(err))?;

        let (start_row, start_col) = range
            .start()
            .map(|(row, col)| (row as usize, col as usize))
            .unwrap_or((0, 0));
        let mut rows: Vec<Vec<String>> = vec![Vec::new(); start_row];
        for (offset, cells) in range.rows().enumerate() {
            let mut row = vec![String::new(); start_col];
            for (col, cell) in cells.iter().enumerate() {
                let text = cell_text(cell).map_err(|code| {
                    read_error(def, &path, format!("cell holds error value {code}"))
                        .with_row(start_row + offset + 1)
                        .with_column(format!("#{}", start_col + col + 1))
                })?;
                row.push(text);
            }
            while row.last().is_some_and(String::is_empty) {
                row.pop();
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// In-memory rows keyed by table name.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    tables: HashMap<String, Vec<Vec<String>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table<R, C>(mut self, name: &str, rows: R) -> Self
    where
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        self.insert(name, rows);
        self
    }

    pub fn insert<R, C>(&mut self, name: &str, rows: R)
    where
        R: IntoIterator<Item = C>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(Into::into).collect())
            .collect();
        self.tables.insert(name.to_string(), rows);
    }
}

impl SourceAdapter for MemorySource {
    fn exists(&self, def: &TableDef) -> bool {
        self.tables.contains_key(&def.name)
    }

    fn rows(&self, def: &TableDef) -> Result<Vec<Vec<String>>, Error> {
        self.tables.get(&def.name).cloned().ok_or_else(|| {
            Error::new(ErrorKind::SourceMissing)
                .with_message("no rows registered")
                .with_table(def.name.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use calamine::Data;
    use rust_xlsxwriter::Workbook;

    use super::{MemorySource, SourceAdapter, XlsxSource, cell_text};
    use crate::config::TableDef;
    use crate::core::error::ErrorKind;

    #[test]
    fn cells_render_as_grammar_text() {
        assert_eq!(cell_text(&Data::Float(3.0)).unwrap(), "3");
        assert_eq!(cell_text(&Data::Float(0.25)).unwrap(), "0.25");
        assert_eq!(cell_text(&Data::Int(-7)).unwrap(), "-7");
        assert_eq!(cell_text(&Data::Bool(true)).unwrap(), "true");
        assert_eq!(cell_text(&Data::Empty).unwrap(), "");
        assert_eq!(cell_text(&Data::String(" a ".into())).unwrap(), " a ");
    }

    #[test]
    fn workbook_rows_keep_sheet_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Item").unwrap();
        sheet.write_string(1, 1, "Int").unwrap();
        sheet.write_number(4, 1, 12.0).unwrap();
        sheet.write_string(4, 2, "sword").unwrap();
        workbook.save(dir.path().join("Item.xlsx")).unwrap();

        let source = XlsxSource::new(dir.path());
        let def = TableDef::new("Item", "Item.xlsx");
        assert!(source.exists(&def));
        let rows = source.rows(&def).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows[0].is_empty());
        assert_eq!(rows[1], ["", "Int"]);
        assert_eq!(rows[4], ["", "12", "sword"]);
    }

    #[test]
    fn missing_workbook_and_sheet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = XlsxSource::new(dir.path());
        let def = TableDef::new("Item", "Item.xlsx");
        assert!(!source.exists(&def));
        assert_eq!(source.rows(&def).unwrap_err().kind(), ErrorKind::SourceMissing);

        let mut workbook = Workbook::new();
        workbook.add_worksheet().set_name("Other").unwrap();
        workbook.save(dir.path().join("Item.xlsx")).unwrap();
        assert_eq!(source.rows(&def).unwrap_err().kind(), ErrorKind::Read);
        assert!(source.rows(&def.with_sheet("Other")).unwrap().is_empty());
    }

    #[test]
    fn memory_source_serves_registered_tables() {
        let source = MemorySource::new().with_table("Item", [["Int"], [""], ["id"], ["1"]]);
        let def = TableDef::new("Item", "unused");
        assert!(source.exists(&def));
        assert_eq!(source.rows(&def).unwrap()[3], ["1"]);
        assert!(!source.exists(&TableDef::new("Shop", "unused")));
    }
}
