//! Purpose: Library behind the `sheetport` CLI: typed spreadsheet tables to Lua/JSON files.
//! Exports: `core` (grammar, parsing, encoding), `hook`, `source`, `config`, `export`.
//! Role: Everything the binary does is reachable here so embedders and tests can drive runs.
//! Invariants: Runs are explicit constructions; there is no global registry or state.
//! Invariants: Fatal conditions come back as `core::error::Error`, never as panics.
pub mod config;
pub mod core;
pub mod export;
pub mod hook;
pub mod source;

pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::export::{Exporter, RunReport};
