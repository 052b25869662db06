//! Purpose: Place encoded tables on disk under the output directory.
//! Exports: `clear_table`, `write_table`.
//! Role: The only module that deletes or writes export files.
//! Invariants: A table's prior aggregate file and per-row directory are removed before writing.
//! Invariants: Per-row file names never escape the table directory.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::encode::{Encoded, Format};
use crate::core::error::{Error, ErrorKind};

const INDEX_STEM: &str = "index";

fn io_error(message: &str, path: &Path, err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message.to_string())
        .with_path(path)
        .with_source(err)
}

fn aggregate_path(out_dir: &Path, table: &str, format: Format) -> PathBuf {
    out_dir.join(format!("{table}.{}", format.extension()))
}

/// Removes every output a previous run may have left for `table`.
pub fn clear_table(out_dir: &Path, table: &str, format: Format) -> Result<(), Error> {
    let file = aggregate_path(out_dir, table, format);
    match fs::remove_file(&file) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_error("failed to remove previous output", &file, err)),
    }
    let dir = out_dir.join(table);
    match fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_error("failed to remove previous output", &dir, err)),
    }
    Ok(())
}

fn check_row_name(table: &str, row: &str) -> Result<(), Error> {
    let unsafe_name = row.is_empty()
        || row == "."
        || row == INDEX_STEM
        || row.contains("..")
        || row.contains('/')
        || row.contains('\\');
    if unsafe_name {
        return Err(Error::new(ErrorKind::Conversion)
            .with_message(format!("row identity `{row}` cannot be used as a file name"))
            .with_table(table)
            .with_hint(
                "Per-row output needs identities without path separators or `..`, other than `index`.",
            ));
    }
    Ok(())
}

/// Clears previous output and writes `encoded`; returns the paths written.
pub fn write_table(
    out_dir: &Path,
    table: &str,
    format: Format,
    encoded: &Encoded,
) -> Result<Vec<PathBuf>, Error> {
    if let Encoded::PerRow { rows, .. } = encoded {
        for (row, _) in rows {
            check_row_name(table, row)?;
        }
    }
    clear_table(out_dir, table, format)?;

    let ext = format.extension();
    match encoded {
        Encoded::Aggregate(bytes) => {
            let path = aggregate_path(out_dir, table, format);
            fs::write(&path, bytes).map_err(|err| io_error("failed to write output", &path, err))?;
            Ok(vec![path])
        }
        Encoded::PerRow { rows, index } => {
            let dir = out_dir.join(table);
            fs::create_dir_all(&dir)
                .map_err(|err| io_error("failed to create table directory", &dir, err))?;
            let mut written = Vec::with_capacity(rows.len() + 1);
            for (row, bytes) in rows {
                let path = dir.join(format!("{row}.{ext}"));
                fs::write(&path, bytes)
                    .map_err(|err| io_error("failed to write output", &path, err))?;
                written.push(path);
            }
            let path = dir.join(format!("{INDEX_STEM}.{ext}"));
            fs::write(&path, index).map_err(|err| io_error("failed to write output", &path, err))?;
            written.push(path);
            Ok(written)
        }
    }
}
