//! Purpose: Single error type shared by every export stage.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`.
//! Role: Carries the failure taxonomy plus table/row/column context for diagnostics.
//! Invariants: Every fatal condition maps to exactly one `ErrorKind`.
//! Invariants: Exit codes per kind are stable once published.
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Config,
    SourceMissing,
    Read,
    Grammar,
    Conversion,
    DuplicateResult,
    Engine,
    Io,
}

impl ErrorKind {
    /// Only a missing source is tolerated; the coordinator skips that table.
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::SourceMissing)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    table: Option<String>,
    row: Option<usize>,
    column: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            table: None,
            row: None,
            column: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// 1-based sheet row the error was raised on.
    pub fn row(&self) -> Option<usize> {
        self.row
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Fills table/row/column only where the error does not already carry them,
    /// so the innermost context wins.
    pub fn or_context(mut self, table: &str, row: Option<usize>, column: Option<&str>) -> Self {
        if self.table.is_none() {
            self.table = Some(table.to_string());
        }
        if self.row.is_none() {
            self.row = row;
        }
        if self.column.is_none() {
            self.column = column.map(str::to_string);
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(table) = &self.table {
            write!(f, " (table: {table})")?;
        }
        if let Some(row) = self.row {
            write!(f, " (row: {row})")?;
        }
        if let Some(column) = &self.column {
            write!(f, " (column: {column})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Config => 3,
        ErrorKind::SourceMissing => 4,
        ErrorKind::Read => 5,
        ErrorKind::Grammar => 6,
        ErrorKind::Conversion => 7,
        ErrorKind::DuplicateResult => 8,
        ErrorKind::Engine => 9,
        ErrorKind::Io => 10,
    }
}
